//! Mapped image memory and the section-protection discipline.
//!
//! This module owns the two pieces of state the rest of the loader mutates:
//!
//! - [`MappedImage`] - an image laid out in virtual form, together with a
//!   per-region protection table derived from the section characteristics
//! - [`ProtectionGuard`] - the scoped elevate/restore window that is the only way
//!   to write into a mapped image
//!
//! The protection table plays the role of the page-protection state a native
//! loader manipulates around relocation and import binding. Tracking it in the
//! engine keeps the bracketing discipline checkable on every write: a write
//! outside an active window fails with
//! [`crate::Error::ProtectionViolation`] instead of silently mutating memory the
//! image expects to be read-only. Restoration is tied to [`Drop`], so no exit
//! path, early error return or otherwise, can leak an elevated window.
//!
//! # Examples
//!
//! ```rust,no_run
//! use peload::ImageMapper;
//!
//! let mut image = ImageMapper::host().map_file("plugin.dll".as_ref())?;
//!
//! // Writes require an explicit window; restoration happens when the guard drops.
//! let iat_rva = 0x2000;
//! let mut guard = image.elevate_region(iat_rva, 8)?;
//! guard.write_u64(iat_rva, 0xDEAD_BEEF)?;
//! drop(guard);
//! # Ok::<(), peload::Error>(())
//! ```

pub mod mapper;

pub use mapper::ImageMapper;

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    pe::{
        constants::PageProtection,
        headers::ImageHeaders,
        view::ImageView,
    },
    Result, Rva, Va,
};

/// One protected region of a mapped image: the header pages or one section.
#[derive(Debug, Clone, Copy)]
struct ProtectionRegion {
    start: u32,
    len: u32,
    protection: PageProtection,
}

impl ProtectionRegion {
    fn contains(&self, rva: Rva) -> bool {
        rva >= self.start && u64::from(rva) < u64::from(self.start) + u64::from(self.len)
    }

    fn overlaps(&self, start: Rva, len: u32) -> bool {
        let a0 = u64::from(self.start);
        let a1 = a0 + u64::from(self.len);
        let b0 = u64::from(start);
        let b1 = b0 + u64::from(len);

        a0 < b1 && b0 < a1
    }
}

/// An image mapped into the process in virtual layout.
///
/// The mapping owns its memory; its base address is the allocation address, so
/// relocation deltas and resolved export addresses are real pointers into the
/// mapping. A protection region table (header pages plus one region per section,
/// initialized from the section characteristics) guards all writes.
///
/// Once a load fully succeeds the mapping is moved into the loader directory and
/// shared from there; during the load sequence the orchestrator holds it
/// exclusively.
#[derive(Debug)]
pub struct MappedImage {
    memory: Box<[u8]>,
    headers: ImageHeaders,
    path: PathBuf,
    regions: Mutex<Vec<ProtectionRegion>>,
}

impl MappedImage {
    /// Builds a mapping from virtual-layout memory and its parsed headers.
    ///
    /// Initial protections: header pages are read-only, each section gets the
    /// protection its characteristics describe.
    pub(crate) fn new(memory: Vec<u8>, headers: ImageHeaders, path: PathBuf) -> MappedImage {
        let mut regions = Vec::with_capacity(headers.sections.len() + 1);

        regions.push(ProtectionRegion {
            start: 0,
            len: headers.size_of_headers,
            protection: PageProtection::READ,
        });

        for section in &headers.sections {
            regions.push(ProtectionRegion {
                start: section.virtual_address,
                len: section.mapped_size(),
                protection: section.characteristics.page_protection(),
            });
        }

        MappedImage {
            memory: memory.into_boxed_slice(),
            headers,
            path,
            regions: Mutex::new(regions),
        }
    }

    /// Returns the base address of the mapping.
    #[must_use]
    pub fn base(&self) -> Va {
        self.memory.as_ptr() as Va
    }

    /// Returns the size of the mapping in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.headers.size_of_image
    }

    /// Returns the parsed header summary.
    #[must_use]
    pub fn headers(&self) -> &ImageHeaders {
        &self.headers
    }

    /// Returns the path the image was mapped from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a bounds-checked view of the mapping.
    #[must_use]
    pub fn view(&self) -> ImageView<'_> {
        ImageView::new(&self.memory)
    }

    /// Converts an RVA to a virtual address within this mapping.
    #[must_use]
    pub fn rva_to_va(&self, rva: Rva) -> Va {
        self.base() + Va::from(rva)
    }

    /// Converts a virtual address back to an RVA, if it falls inside the mapping.
    #[must_use]
    pub fn va_to_rva(&self, va: Va) -> Option<Rva> {
        let offset = va.checked_sub(self.base())?;
        if offset < u64::from(self.size()) {
            Some(offset as Rva)
        } else {
            None
        }
    }

    /// Returns `true` if `va` falls inside the mapping.
    #[must_use]
    pub fn contains_va(&self, va: Va) -> bool {
        self.va_to_rva(va).is_some()
    }

    /// Returns the current protection of the region containing `rva`.
    ///
    /// Bytes outside every region (alignment gaps) report no access.
    #[must_use]
    pub fn protection_at(&self, rva: Rva) -> PageProtection {
        let regions = lock!(self.regions);
        regions
            .iter()
            .find(|r| r.contains(rva))
            .map_or(PageProtection::empty(), |r| r.protection)
    }

    /// Opens a writable window over every region overlapping `[rva, rva + len)`.
    ///
    /// The prior protections are restored when the returned guard drops,
    /// whichever way the enclosing scope exits.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range lies outside the
    /// mapping or overlaps no region.
    pub fn elevate_region(&mut self, rva: Rva, len: u32) -> Result<ProtectionGuard<'_>> {
        let end = u64::from(rva) + u64::from(len);
        if end > u64::from(self.size()) {
            return Err(crate::Error::OutOfBounds);
        }

        let saved = {
            let mut regions = lock!(self.regions);
            let mut saved = Vec::new();
            for (index, region) in regions.iter_mut().enumerate() {
                if region.overlaps(rva, len) {
                    saved.push((index, region.protection));
                    region.protection = PageProtection::READ | PageProtection::WRITE;
                }
            }
            saved
        };

        if saved.is_empty() {
            return Err(crate::Error::OutOfBounds);
        }

        Ok(ProtectionGuard { image: self, saved })
    }

    /// Opens a writable window over every section of the image.
    ///
    /// Used by the relocation engine, whose fixups may touch any section. Header
    /// pages stay read-only.
    pub fn elevate_sections(&mut self) -> Result<ProtectionGuard<'_>> {
        let saved = {
            let mut regions = lock!(self.regions);
            let mut saved = Vec::new();
            // Region 0 is the header pages.
            for (index, region) in regions.iter_mut().enumerate().skip(1) {
                saved.push((index, region.protection));
                region.protection = PageProtection::READ | PageProtection::WRITE;
            }
            saved
        };

        Ok(ProtectionGuard { image: self, saved })
    }

    fn restore_regions(&self, saved: &[(usize, PageProtection)]) {
        let mut regions = lock!(self.regions);
        for &(index, protection) in saved {
            regions[index].protection = protection;
        }
    }

    fn write_bytes(&mut self, rva: Rva, bytes: &[u8]) -> Result<()> {
        if !self.protection_at(rva).contains(PageProtection::WRITE) {
            return Err(crate::Error::ProtectionViolation {
                va: self.rva_to_va(rva),
            });
        }

        let start = rva as usize;
        let end = start
            .checked_add(bytes.len())
            .ok_or(crate::Error::OutOfBounds)?;
        let target = self
            .memory
            .get_mut(start..end)
            .ok_or(crate::Error::OutOfBounds)?;

        target.copy_from_slice(bytes);
        Ok(())
    }
}

/// A scoped writable window over part of a [`MappedImage`].
///
/// This is the only write path into image memory. The saved protections are
/// restored on [`Drop`], so the elevate/restore bracket cannot be left open by an
/// early return. The guard borrows the image mutably for its whole lifetime,
/// which also makes "all resolution work joined before the window closes" a
/// borrow-checker fact rather than a convention.
#[derive(Debug)]
pub struct ProtectionGuard<'a> {
    image: &'a mut MappedImage,
    saved: Vec<(usize, PageProtection)>,
}

impl ProtectionGuard<'_> {
    /// Returns the guarded image.
    #[must_use]
    pub fn image(&self) -> &MappedImage {
        self.image
    }

    /// Returns a bounds-checked view of the guarded image.
    #[must_use]
    pub fn view(&self) -> ImageView<'_> {
        self.image.view()
    }

    /// Writes a little-endian `u16` at `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ProtectionViolation`] if the target is not inside
    /// a writable region, or [`crate::Error::OutOfBounds`] if it lies outside the
    /// mapping.
    pub fn write_u16(&mut self, rva: Rva, value: u16) -> Result<()> {
        self.image.write_bytes(rva, &value.to_le_bytes())
    }

    /// Writes a little-endian `u32` at `rva`.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ProtectionGuard::write_u16`].
    pub fn write_u32(&mut self, rva: Rva, value: u32) -> Result<()> {
        self.image.write_bytes(rva, &value.to_le_bytes())
    }

    /// Writes a little-endian `u64` at `rva`.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ProtectionGuard::write_u16`].
    pub fn write_u64(&mut self, rva: Rva, value: u64) -> Result<()> {
        self.image.write_bytes(rva, &value.to_le_bytes())
    }
}

impl Drop for ProtectionGuard<'_> {
    fn drop(&mut self) {
        self.image.restore_regions(&self.saved);
    }
}
