//! Validated parsing of PE headers from a mapped image.
//!
//! [`ImageHeaders`] is the one-shot, validated summary of everything the loader
//! needs from the DOS header, NT headers, optional header, data directories and
//! section table. It is parsed once when an image is mapped and then consulted by
//! the relocation engine, the import binders and the export resolver; none of
//! those ever touch header bytes directly.
//!
//! Both PE32 and PE32+ optional headers are supported. All reads go through
//! [`crate::pe::view::ImageView`], so a truncated or adversarial header can never
//! cause an out-of-bounds access.

use crate::{
    pe::{
        constants::{
            DIRECTORY_ENTRY_COUNT, DIRECTORY_ENTRY_LOAD_CONFIG, DOS_LFANEW_OFFSET, DOS_SIGNATURE,
            FileCharacteristics, NT_SIGNATURE, OPTIONAL_MAGIC_PE32, OPTIONAL_MAGIC_PE64,
            SECTION_HEADER_SIZE, SectionCharacteristics,
        },
        view::ImageView,
    },
    Result, Rva,
};

/// One data-directory slot of the optional header.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataDirectory {
    /// RVA of the directory data, zero if absent.
    pub virtual_address: u32,
    /// Size of the directory data in bytes, zero if absent.
    pub size: u32,
}

impl DataDirectory {
    /// Returns `true` if the directory slot is populated.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// One entry of the section table.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    /// Raw section name, NUL-padded.
    pub name: [u8; 8],
    /// Size of the section once mapped.
    pub virtual_size: u32,
    /// RVA at which the section is mapped.
    pub virtual_address: u32,
    /// Size of the section's initialized data on disk.
    pub size_of_raw_data: u32,
    /// File offset of the section's raw data.
    pub pointer_to_raw_data: u32,
    /// Section characteristics.
    pub characteristics: SectionCharacteristics,
}

impl SectionHeader {
    /// Returns the section name with NUL padding stripped.
    #[must_use]
    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name)
            .unwrap_or("")
            .trim_end_matches('\0')
    }

    /// Returns `true` if `rva` falls within the section's initialized span.
    ///
    /// Matches the loader's RVA-to-section walk, which considers the raw-data span
    /// rather than the virtual span.
    #[must_use]
    pub fn contains_rva(&self, rva: Rva) -> bool {
        let rva = u64::from(rva);
        let start = u64::from(self.virtual_address);

        rva >= start && rva < start + u64::from(self.size_of_raw_data)
    }

    /// Returns the length of the section's mapped span.
    #[must_use]
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size != 0 {
            self.virtual_size
        } else {
            self.size_of_raw_data
        }
    }
}

/// Validated summary of a mapped image's headers.
///
/// Parsed once per mapping from virtual-layout bytes; every later stage of the load
/// sequence works from this summary instead of re-walking header bytes.
#[derive(Debug, Clone)]
pub struct ImageHeaders {
    /// Machine type from the file header.
    pub machine: u16,
    /// File header characteristics.
    pub characteristics: FileCharacteristics,
    /// Subsystem from the optional header.
    pub subsystem: u16,
    /// `true` for PE32+, `false` for PE32.
    pub pe64: bool,
    /// The image base the linker assumed.
    pub preferred_base: u64,
    /// Size of the mapped image in bytes.
    pub size_of_image: u32,
    /// Size of the header region in bytes.
    pub size_of_headers: u32,
    /// Entry point RVA, zero if the image has none.
    pub entry_point: Rva,
    /// The data-directory table.
    pub directories: [DataDirectory; DIRECTORY_ENTRY_COUNT],
    /// The section table, in file order.
    pub sections: Vec<SectionHeader>,
    /// `GuardFlags` from the load-configuration directory, zero if absent.
    pub guard_flags: u32,
}

impl ImageHeaders {
    /// Parses and validates the headers of a mapped (virtual-layout) image.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ImageFormat`] for bad signatures or malformed header
    /// fields, and [`crate::Error::OutOfBounds`] if any header structure extends
    /// past the mapping.
    pub fn parse(data: &[u8]) -> Result<ImageHeaders> {
        if data.is_empty() {
            return Err(crate::Error::Empty);
        }

        let view = ImageView::new(data);

        if view.read_u16(0)? != DOS_SIGNATURE {
            return Err(image_error!("missing MZ signature"));
        }

        let lfanew = view.read_u32(DOS_LFANEW_OFFSET)?;
        if lfanew == 0 || lfanew >= i32::MAX as u32 {
            return Err(image_error!("invalid e_lfanew {:#x}", lfanew));
        }

        if view.read_u32(lfanew)? != NT_SIGNATURE {
            return Err(image_error!("missing PE signature"));
        }

        let coff = lfanew
            .checked_add(4)
            .ok_or_else(|| image_error!("NT headers offset overflow"))?;
        let machine = view.read_u16(coff)?;
        let number_of_sections = view.read_u16(coff + 2)?;
        let size_of_optional_header = view.read_u16(coff + 16)?;
        let characteristics = FileCharacteristics::from_bits_truncate(view.read_u16(coff + 18)?);

        if size_of_optional_header < 2 {
            return Err(image_error!("optional header missing"));
        }

        let opt = coff + 20;
        let magic = view.read_u16(opt)?;
        let pe64 = match magic {
            OPTIONAL_MAGIC_PE64 => true,
            OPTIONAL_MAGIC_PE32 => false,
            _ => return Err(image_error!("unknown optional header magic {:#06x}", magic)),
        };

        let entry_point = view.read_u32(opt + 16)?;
        let preferred_base = if pe64 {
            view.read_u64(opt + 24)?
        } else {
            u64::from(view.read_u32(opt + 28)?)
        };
        let size_of_image = view.read_u32(opt + 56)?;
        let size_of_headers = view.read_u32(opt + 60)?;
        let subsystem = view.read_u16(opt + 68)?;

        if size_of_image as usize > data.len() {
            return Err(image_error!(
                "SizeOfImage {:#x} exceeds the mapping of {:#x} bytes",
                size_of_image,
                data.len()
            ));
        }
        if size_of_headers > size_of_image {
            return Err(image_error!("SizeOfHeaders exceeds SizeOfImage"));
        }

        let (rva_count_offset, directories_offset) = if pe64 {
            (opt + 108, opt + 112)
        } else {
            (opt + 92, opt + 96)
        };

        let rva_count = view.read_u32(rva_count_offset)?.min(DIRECTORY_ENTRY_COUNT as u32);
        let mut directories = [DataDirectory::default(); DIRECTORY_ENTRY_COUNT];
        for (i, directory) in directories.iter_mut().enumerate().take(rva_count as usize) {
            let entry = directories_offset + (i as u32) * 8;
            directory.virtual_address = view.read_u32(entry)?;
            directory.size = view.read_u32(entry + 4)?;
        }

        let section_table = opt + u32::from(size_of_optional_header);
        let mut sections = Vec::with_capacity(number_of_sections as usize);
        for i in 0..u32::from(number_of_sections) {
            let entry = section_table
                .checked_add(i * SECTION_HEADER_SIZE as u32)
                .ok_or_else(|| image_error!("section table offset overflow"))?;
            let raw = view.rva_to_slice(entry, SECTION_HEADER_SIZE)?;

            let mut name = [0u8; 8];
            name.copy_from_slice(&raw[..8]);

            sections.push(SectionHeader {
                name,
                virtual_size: view.read_u32(entry + 8)?,
                virtual_address: view.read_u32(entry + 12)?,
                size_of_raw_data: view.read_u32(entry + 16)?,
                pointer_to_raw_data: view.read_u32(entry + 20)?,
                characteristics: SectionCharacteristics::from_bits_truncate(
                    view.read_u32(entry + 36)?,
                ),
            });
        }

        let mut headers = ImageHeaders {
            machine,
            characteristics,
            subsystem,
            pe64,
            preferred_base,
            size_of_image,
            size_of_headers,
            entry_point,
            directories,
            sections,
            guard_flags: 0,
        };
        headers.guard_flags = headers.read_guard_flags(view)?;

        Ok(headers)
    }

    /// Returns the directory at `index` if the slot is populated.
    #[must_use]
    pub fn directory(&self, index: usize) -> Option<&DataDirectory> {
        self.directories.get(index).filter(|d| d.is_present())
    }

    /// Returns the section whose initialized span contains `rva`.
    #[must_use]
    pub fn section_containing_rva(&self, rva: Rva) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// Reads `GuardFlags` from the load-configuration directory.
    ///
    /// The flags live at different offsets in the 32-bit and 64-bit layouts, and
    /// the structure is self-sized: the flags are only read when both the declared
    /// structure size and the directory span cover them.
    fn read_guard_flags(&self, view: ImageView<'_>) -> Result<u32> {
        let Some(directory) = self.directory(DIRECTORY_ENTRY_LOAD_CONFIG) else {
            return Ok(0);
        };

        let flags_offset: u32 = if self.pe64 { 144 } else { 88 };
        if directory.size < flags_offset + 4 {
            return Ok(0);
        }

        let declared_size = view.read_u32(directory.virtual_address)?;
        if declared_size < flags_offset + 4 {
            return Ok(0);
        }

        view.read_u32(directory.virtual_address + flags_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::constants::{DIRECTORY_ENTRY_EXPORT, MACHINE_AMD64, SUBSYSTEM_WINDOWS_GUI};

    fn put_u16(data: &mut [u8], offset: usize, value: u16) {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(data: &mut [u8], offset: usize, value: u64) {
        data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Minimal PE32+ header blob with one section, laid out as a mapped image.
    fn minimal_pe64(size_of_image: u32) -> Vec<u8> {
        let mut data = vec![0u8; size_of_image as usize];
        let lfanew = 0x80usize;

        put_u16(&mut data, 0, DOS_SIGNATURE);
        put_u32(&mut data, DOS_LFANEW_OFFSET as usize, lfanew as u32);
        put_u32(&mut data, lfanew, NT_SIGNATURE);

        let coff = lfanew + 4;
        put_u16(&mut data, coff, MACHINE_AMD64);
        put_u16(&mut data, coff + 2, 1); // one section
        put_u16(&mut data, coff + 16, 240); // optional header size
        put_u16(&mut data, coff + 18, 0x2022); // EXECUTABLE_IMAGE | DLL

        let opt = coff + 20;
        put_u16(&mut data, opt, OPTIONAL_MAGIC_PE64);
        put_u32(&mut data, opt + 16, 0x1010); // entry point
        put_u64(&mut data, opt + 24, 0x1_8000_0000); // image base
        put_u32(&mut data, opt + 56, size_of_image);
        put_u32(&mut data, opt + 60, 0x400);
        put_u16(&mut data, opt + 68, SUBSYSTEM_WINDOWS_GUI);
        put_u32(&mut data, opt + 108, 16);

        // export directory slot
        put_u32(&mut data, opt + 112, 0x1000);
        put_u32(&mut data, opt + 116, 0x100);

        let section = opt + 240;
        data[section..section + 5].copy_from_slice(b".text");
        put_u32(&mut data, section + 8, 0x800); // virtual size
        put_u32(&mut data, section + 12, 0x1000); // virtual address
        put_u32(&mut data, section + 16, 0x800); // raw size
        put_u32(&mut data, section + 20, 0x400); // raw pointer
        put_u32(&mut data, section + 36, 0x6000_0020); // code | exec | read

        data
    }

    #[test]
    fn test_parse_minimal_image() {
        let data = minimal_pe64(0x2000);
        let headers = ImageHeaders::parse(&data).unwrap();

        assert!(headers.pe64);
        assert_eq!(headers.machine, MACHINE_AMD64);
        assert_eq!(headers.preferred_base, 0x1_8000_0000);
        assert_eq!(headers.entry_point, 0x1010);
        assert_eq!(headers.sections.len(), 1);
        assert_eq!(headers.sections[0].name(), ".text");
        assert!(headers.directory(DIRECTORY_ENTRY_EXPORT).is_some());
        assert!(headers.directory(DIRECTORY_ENTRY_LOAD_CONFIG).is_none());
        assert_eq!(headers.guard_flags, 0);
    }

    #[test]
    fn test_parse_rejects_bad_signatures() {
        let mut data = minimal_pe64(0x2000);
        data[0] = b'X';
        assert!(ImageHeaders::parse(&data).is_err());

        let mut data = minimal_pe64(0x2000);
        data[0x80] = 0;
        assert!(ImageHeaders::parse(&data).is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_declarations() {
        let mut data = minimal_pe64(0x2000);
        // SizeOfImage larger than the actual mapping
        let opt = 0x80 + 4 + 20;
        put_u32(&mut data, opt + 56, 0x10_0000);
        assert!(ImageHeaders::parse(&data).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_section_table() {
        let mut data = minimal_pe64(0x2000);
        let coff = 0x80 + 4;
        put_u16(&mut data, coff + 2, 200); // section table extends past the image
        assert!(ImageHeaders::parse(&data).is_err());
    }

    #[test]
    fn test_section_lookup() {
        let data = minimal_pe64(0x2000);
        let headers = ImageHeaders::parse(&data).unwrap();

        assert!(headers.section_containing_rva(0x1000).is_some());
        assert!(headers.section_containing_rva(0x17FF).is_some());
        assert!(headers.section_containing_rva(0x1800).is_none());
        assert!(headers.section_containing_rva(0x0FFF).is_none());
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(ImageHeaders::parse(&[]), Err(crate::Error::Empty)));
    }
}
