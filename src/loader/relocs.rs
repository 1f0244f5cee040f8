//! Base relocation of images mapped away from their preferred base.
//!
//! The relocation directory is a sequence of blocks, one per 4 KiB page, each
//! holding 16-bit `(type, offset)` records. Three record types are applied
//! (`LOW`, `HIGHLOW`, `DIR64`); unknown types are skipped, which matches the
//! behavior real images rely on since other types do not occur on the supported
//! machines. All writes happen inside one protection window spanning the
//! sections; the window's drop restores the protections derived from the section
//! characteristics, and executable sections get their instruction cache flushed
//! afterwards.

use log::debug;

use crate::{
    host::HostEnv,
    image::MappedImage,
    pe::constants::{
        DIRECTORY_ENTRY_BASERELOC, FileCharacteristics, REL_BASED_ABSOLUTE, REL_BASED_DIR64,
        REL_BASED_HIGHLOW, REL_BASED_LOW, RELOCATION_BLOCK_HEADER_SIZE, SectionCharacteristics,
    },
    Result,
};

/// Applies base relocations to `image` if it is mapped off its preferred base.
///
/// A `relocs_stripped` image succeeds without being touched, as does an image
/// that happens to sit at its preferred base. No memory is made writable before
/// the directory presence check passes.
///
/// # Errors
///
/// Returns [`crate::Error::Relocation`] if the image is mapped off-base without
/// a relocation directory or a block is malformed, and
/// [`crate::Error::OutOfBounds`] if a record points outside the mapping.
pub(crate) fn relocate_image(image: &mut MappedImage, host: &dyn HostEnv) -> Result<()> {
    let headers = image.headers().clone();

    if headers
        .characteristics
        .contains(FileCharacteristics::RELOCS_STRIPPED)
    {
        return Ok(());
    }

    let delta = image.base().wrapping_sub(headers.preferred_base);
    if delta == 0 {
        return Ok(());
    }

    let Some(directory) = headers.directory(DIRECTORY_ENTRY_BASERELOC).copied() else {
        return Err(crate::Error::Relocation(
            "image mapped off-base carries no relocation directory".to_string(),
        ));
    };

    {
        let mut guard = image.elevate_sections()?;
        let mut offset = 0u32;

        while offset < directory.size {
            if directory.size - offset < RELOCATION_BLOCK_HEADER_SIZE as u32 {
                return Err(crate::Error::Relocation(format!(
                    "{} trailing bytes after the last block",
                    directory.size - offset
                )));
            }

            let block = directory.virtual_address + offset;
            let page_rva = guard.view().read_u32(block)?;
            let block_size = guard.view().read_u32(block + 4)?;

            if block_size < RELOCATION_BLOCK_HEADER_SIZE as u32
                || block_size % 2 != 0
                || block_size > directory.size - offset
            {
                return Err(crate::Error::Relocation(format!(
                    "block at rva {block:#x} declares {block_size:#x} bytes"
                )));
            }

            let records = (block_size - RELOCATION_BLOCK_HEADER_SIZE as u32) / 2;
            for index in 0..records {
                let record = guard.view().read_u16(block + 8 + index * 2)?;
                let kind = record >> 12;
                let target = page_rva + u32::from(record & 0x0FFF);

                match kind {
                    REL_BASED_ABSOLUTE => {}
                    REL_BASED_LOW => {
                        let value = guard.view().read_u16(target)?;
                        guard.write_u16(target, value.wrapping_add(delta as u16))?;
                    }
                    REL_BASED_HIGHLOW => {
                        let value = guard.view().read_u32(target)?;
                        guard.write_u32(target, value.wrapping_add(delta as u32))?;
                    }
                    REL_BASED_DIR64 => {
                        let value = guard.view().read_u64(target)?;
                        guard.write_u64(target, value.wrapping_add(delta))?;
                    }
                    other => {
                        debug!("skipping relocation type {other} at rva {target:#x}");
                    }
                }
            }

            offset += block_size;
        }
    }

    for section in &headers.sections {
        if section
            .characteristics
            .contains(SectionCharacteristics::MEM_EXECUTE)
        {
            host.flush_instruction_cache(
                image.rva_to_va(section.virtual_address),
                u64::from(section.mapped_size()),
            );
        }
    }

    debug!("relocated image at {:#x} by delta {:#x}", image.base(), delta);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::{
        host::{LifecycleReason, ProcessHost},
        pe::constants::PageProtection,
        test::{mapped, put_u16, put_u32, put_u64, set_directory, two_section_pe64},
        Va,
    };

    const PREFERRED_BASE: u64 = 0x1_8000_0000;

    // One block for the .text page: DIR64 @0x1100, HIGHLOW @0x1200, LOW @0x1300,
    // one ABSOLUTE padding record.
    fn reloc_image() -> Vec<u8> {
        let mut data = two_section_pe64();
        set_directory(&mut data, DIRECTORY_ENTRY_BASERELOC, 0x2400, 16);

        put_u32(&mut data, 0x2400, 0x1000); // page rva
        put_u32(&mut data, 0x2404, 16); // block size
        put_u16(&mut data, 0x2408, (REL_BASED_DIR64 << 12) | 0x100);
        put_u16(&mut data, 0x240A, (REL_BASED_HIGHLOW << 12) | 0x200);
        put_u16(&mut data, 0x240C, (REL_BASED_LOW << 12) | 0x300);
        put_u16(&mut data, 0x240E, 0); // absolute padding

        put_u64(&mut data, 0x1100, 0x1111_2222_3333_4444);
        put_u32(&mut data, 0x1200, 0x5555_6666);
        put_u16(&mut data, 0x1300, 0x7788);

        data
    }

    #[test]
    fn test_relocation_applies_exact_delta() {
        let mut image = mapped(reloc_image());
        let delta = image.base().wrapping_sub(PREFERRED_BASE);

        relocate_image(&mut image, &ProcessHost::new()).unwrap();

        let view = image.view();
        assert_eq!(
            view.read_u64(0x1100).unwrap(),
            0x1111_2222_3333_4444u64.wrapping_add(delta)
        );
        assert_eq!(
            view.read_u32(0x1200).unwrap(),
            0x5555_6666u32.wrapping_add(delta as u32)
        );
        assert_eq!(
            view.read_u16(0x1300).unwrap(),
            0x7788u16.wrapping_add(delta as u16)
        );

        // protections are restored once the window closes
        assert_eq!(
            image.protection_at(0x1000),
            PageProtection::READ | PageProtection::EXECUTE
        );
        assert_eq!(image.protection_at(0x2000), PageProtection::READ);
    }

    #[test]
    fn test_relocs_stripped_image_untouched() {
        let mut data = reloc_image();
        let coff = 0x80 + 4;
        put_u16(&mut data, coff + 18, 0x2023); // add RELOCS_STRIPPED

        let mut image = mapped(data);
        relocate_image(&mut image, &ProcessHost::new()).unwrap();

        assert_eq!(image.view().read_u64(0x1100).unwrap(), 0x1111_2222_3333_4444);
        assert_eq!(image.view().read_u16(0x1300).unwrap(), 0x7788);
    }

    #[test]
    fn test_off_base_without_directory_fails() {
        let mut image = mapped(two_section_pe64());
        let err = relocate_image(&mut image, &ProcessHost::new()).unwrap_err();
        assert!(matches!(err, crate::Error::Relocation(_)));
    }

    #[test]
    fn test_unknown_relocation_type_skipped() {
        let mut data = two_section_pe64();
        set_directory(&mut data, DIRECTORY_ENTRY_BASERELOC, 0x2400, 12);
        put_u32(&mut data, 0x2400, 0x1000);
        put_u32(&mut data, 0x2404, 12);
        put_u16(&mut data, 0x2408, (9 << 12) | 0x100); // IMAGE_REL_BASED_MIPS_JMPADDR16
        put_u16(&mut data, 0x240A, 0);
        put_u64(&mut data, 0x1100, 0xAAAA_BBBB_CCCC_DDDD);

        let mut image = mapped(data);
        relocate_image(&mut image, &ProcessHost::new()).unwrap();

        assert_eq!(image.view().read_u64(0x1100).unwrap(), 0xAAAA_BBBB_CCCC_DDDD);
    }

    #[test]
    fn test_malformed_block_rejected() {
        let mut data = two_section_pe64();
        set_directory(&mut data, DIRECTORY_ENTRY_BASERELOC, 0x2400, 16);
        put_u32(&mut data, 0x2400, 0x1000);
        put_u32(&mut data, 0x2404, 0x100); // block overruns the directory

        let mut image = mapped(data);
        let err = relocate_image(&mut image, &ProcessHost::new()).unwrap_err();
        assert!(matches!(err, crate::Error::Relocation(_)));

        // the failed pass must not leak an elevated window
        assert_eq!(image.protection_at(0x2000), PageProtection::READ);
    }

    struct FlushHost {
        flushed: Mutex<Vec<(Va, u64)>>,
    }

    impl crate::host::HostEnv for FlushHost {
        fn locate_module(&self, _name: &str) -> Option<std::path::PathBuf> {
            None
        }

        fn invoke_entry(&self, _base: Va, _entry: Va, _reason: LifecycleReason) -> Result<bool> {
            Ok(true)
        }

        fn flush_instruction_cache(&self, base: Va, len: u64) {
            lock!(self.flushed).push((base, len));
        }
    }

    #[test]
    fn test_instruction_cache_flushed_for_code_sections() {
        let host = FlushHost {
            flushed: Mutex::new(Vec::new()),
        };
        let mut image = mapped(reloc_image());

        relocate_image(&mut image, &host).unwrap();

        // only .text is executable
        let flushed = lock!(host.flushed);
        assert_eq!(*flushed, vec![(image.rva_to_va(0x1000), 0x800)]);
    }
}
