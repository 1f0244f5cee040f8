//! Maps an on-disk PE file into virtual layout.
//!
//! The mapper is the single entry path for image bytes: it validates the on-disk
//! file with goblin, rejects images the plugin loader must not accept (wrong
//! machine, wrong subsystem, non-executable), lays the sections out at their
//! virtual addresses and hands back a [`MappedImage`] with initial section
//! protections applied. Everything after this point works on virtual-layout
//! bytes through the crate's own bounds-checked readers.

use std::{fs::File, path::Path};

use goblin::pe::header::{Header, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC};
use log::debug;
use memmap2::Mmap;

use crate::{
    image::MappedImage,
    pe::{
        constants::{MACHINE_AMD64, MACHINE_ARM64, MACHINE_I386, SUBSYSTEM_WINDOWS_GUI},
        headers::ImageHeaders,
    },
    Result,
};

/// Largest `SizeOfImage` the mapper will allocate.
///
/// A corrupt header must not be able to demand an arbitrarily large allocation.
const MAX_IMAGE_SIZE: u32 = 0x4000_0000;

/// Validates PE files and maps them into virtual layout.
///
/// A mapper is configured with the machine type it accepts; [`ImageMapper::host`]
/// selects the compile-target machine, which is what the plugin loader uses.
///
/// # Examples
///
/// ```rust,no_run
/// use peload::ImageMapper;
///
/// let image = ImageMapper::host().map_file("plugin.dll".as_ref())?;
/// println!("mapped {} at {:#x}", image.path().display(), image.base());
/// # Ok::<(), peload::Error>(())
/// ```
pub struct ImageMapper {
    machine: u16,
}

impl ImageMapper {
    /// Creates a mapper accepting images built for `machine`.
    #[must_use]
    pub fn new(machine: u16) -> ImageMapper {
        ImageMapper { machine }
    }

    /// Creates a mapper accepting images built for the compile-target machine.
    #[must_use]
    pub fn host() -> ImageMapper {
        #[cfg(target_arch = "x86_64")]
        let machine = MACHINE_AMD64;
        #[cfg(target_arch = "x86")]
        let machine = MACHINE_I386;
        #[cfg(target_arch = "aarch64")]
        let machine = MACHINE_ARM64;
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        let machine = MACHINE_AMD64;

        ImageMapper { machine }
    }

    /// Returns the machine type this mapper accepts.
    #[must_use]
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// Maps the PE file at `path` into virtual layout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped,
    /// and any validation error of [`ImageMapper::map_bytes`].
    pub fn map_file(&self, path: &Path) -> Result<MappedImage> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and dropped before this function
        // returns; all bytes are copied into the owned virtual layout.
        let mmap = unsafe { Mmap::map(&file)? };

        self.map_bytes(&mmap, path)
    }

    /// Maps file-layout PE bytes into virtual layout.
    ///
    /// Validation happens in two stages: goblin parses the on-disk headers, then
    /// after the sections are laid out at their virtual addresses the crate's own
    /// [`ImageHeaders`] parse runs against the virtual layout. Nothing is handed
    /// to the caller until both passes succeed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::GoblinErr`] for files goblin rejects,
    /// [`crate::Error::MachineMismatch`], [`crate::Error::NotExecutable`] or
    /// [`crate::Error::SubsystemMismatch`] for images the loader must not accept,
    /// and [`crate::Error::ImageFormat`] for structural violations.
    pub fn map_bytes(&self, bytes: &[u8], path: &Path) -> Result<MappedImage> {
        if bytes.is_empty() {
            return Err(crate::Error::Empty);
        }

        let header = Header::parse(bytes)?;

        if header.coff_header.machine != self.machine {
            return Err(crate::Error::MachineMismatch {
                expected: self.machine,
                found: header.coff_header.machine,
            });
        }

        // EXECUTABLE_IMAGE covers both DLLs and executables.
        if header.coff_header.characteristics & 0x0002 == 0 {
            return Err(crate::Error::NotExecutable);
        }

        let optional = header
            .optional_header
            .ok_or_else(|| image_error!("image has no optional header"))?;
        let subsystem = optional.windows_fields.subsystem;
        if subsystem != SUBSYSTEM_WINDOWS_GUI {
            return Err(crate::Error::SubsystemMismatch(subsystem));
        }

        let size_of_image = optional.windows_fields.size_of_image;
        let size_of_headers = optional.windows_fields.size_of_headers;
        if size_of_image == 0 || size_of_image > MAX_IMAGE_SIZE {
            return Err(image_error!("unreasonable SizeOfImage {:#x}", size_of_image));
        }
        if size_of_headers as usize > bytes.len() || size_of_headers > size_of_image {
            return Err(image_error!("SizeOfHeaders {:#x} out of range", size_of_headers));
        }

        let mut section_table_offset = header.dos_header.pe_pointer as usize
            + SIZEOF_PE_MAGIC
            + SIZEOF_COFF_HEADER
            + header.coff_header.size_of_optional_header as usize;
        let sections = header
            .coff_header
            .sections(bytes, &mut section_table_offset)?;

        let mut memory = vec![0u8; size_of_image as usize];
        memory[..size_of_headers as usize].copy_from_slice(&bytes[..size_of_headers as usize]);

        for section in &sections {
            let raw_len = section.size_of_raw_data as usize;
            if raw_len == 0 {
                continue;
            }

            let raw_start = section.pointer_to_raw_data as usize;
            let raw_end = raw_start
                .checked_add(raw_len)
                .ok_or(crate::Error::OutOfBounds)?;
            let source = bytes
                .get(raw_start..raw_end)
                .ok_or_else(|| image_error!("section raw data extends past the file"))?;

            let va_start = section.virtual_address as usize;
            let va_end = va_start
                .checked_add(raw_len)
                .ok_or(crate::Error::OutOfBounds)?;
            let target = memory
                .get_mut(va_start..va_end)
                .ok_or_else(|| image_error!("section extends past SizeOfImage"))?;

            target.copy_from_slice(source);
        }

        let headers = ImageHeaders::parse(&memory)?;
        let image = MappedImage::new(memory, headers, path.to_path_buf());

        debug!(
            "mapped {} at {:#x} ({:#x} bytes, {} sections)",
            path.display(),
            image.base(),
            image.size(),
            image.headers().sections.len()
        );

        Ok(image)
    }
}
