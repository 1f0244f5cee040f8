//! Shared helpers for in-crate unit tests.
//!
//! Builds tiny virtual-layout PE32+ blobs without going through the file mapper,
//! so the protection table, the relocation engine and the resolvers can be
//! exercised directly. The integration tests under `tests/` carry their own
//! full file-layout builder.

use std::path::PathBuf;

use crate::{
    image::MappedImage,
    pe::{
        constants::{
            DOS_LFANEW_OFFSET, DOS_SIGNATURE, MACHINE_AMD64, NT_SIGNATURE, OPTIONAL_MAGIC_PE64,
            SUBSYSTEM_WINDOWS_GUI,
        },
        headers::ImageHeaders,
    },
};

pub(crate) fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// One section of a [`pe64_image`] blob.
pub(crate) struct TestSection {
    pub name: &'static [u8],
    pub virtual_address: u32,
    pub size: u32,
    pub characteristics: u32,
}

/// Builds a virtual-layout PE32+ blob with the given sections.
///
/// Headers occupy the first 0x400 bytes and the optional header carries 16 empty
/// directory slots; callers patch directories and section contents afterwards.
pub(crate) fn pe64_image(size_of_image: u32, sections: &[TestSection]) -> Vec<u8> {
    let mut data = vec![0u8; size_of_image as usize];
    let lfanew = 0x80usize;

    put_u16(&mut data, 0, DOS_SIGNATURE);
    put_u32(&mut data, DOS_LFANEW_OFFSET as usize, lfanew as u32);
    put_u32(&mut data, lfanew, NT_SIGNATURE);

    let coff = lfanew + 4;
    put_u16(&mut data, coff, MACHINE_AMD64);
    put_u16(&mut data, coff + 2, sections.len() as u16);
    put_u16(&mut data, coff + 16, 240); // optional header size
    put_u16(&mut data, coff + 18, 0x2022); // EXECUTABLE_IMAGE | DLL

    let opt = coff + 20;
    put_u16(&mut data, opt, OPTIONAL_MAGIC_PE64);
    put_u32(&mut data, opt + 16, 0x1010); // entry point
    put_u64(&mut data, opt + 24, 0x1_8000_0000); // preferred base
    put_u32(&mut data, opt + 56, size_of_image);
    put_u32(&mut data, opt + 60, 0x400);
    put_u16(&mut data, opt + 68, SUBSYSTEM_WINDOWS_GUI);
    put_u32(&mut data, opt + 108, 16);

    let mut entry = opt + 240;
    for section in sections {
        data[entry..entry + section.name.len()].copy_from_slice(section.name);
        put_u32(&mut data, entry + 8, section.size); // virtual size
        put_u32(&mut data, entry + 12, section.virtual_address);
        put_u32(&mut data, entry + 16, section.size); // raw size
        put_u32(&mut data, entry + 20, section.virtual_address);
        put_u32(&mut data, entry + 36, section.characteristics);
        entry += 40;
    }

    data
}

/// Offset of the first data-directory slot in a [`pe64_image`] blob.
pub(crate) const DIRECTORY_TABLE_OFFSET: usize = 0x80 + 4 + 20 + 112;

/// Patches directory slot `index` of a [`pe64_image`] blob.
pub(crate) fn set_directory(data: &mut [u8], index: usize, rva: u32, size: u32) {
    let entry = DIRECTORY_TABLE_OFFSET + index * 8;
    put_u32(data, entry, rva);
    put_u32(data, entry + 4, size);
}

/// A 0x3000-byte image with an executable `.text` and a read-only `.rdata`.
pub(crate) fn two_section_pe64() -> Vec<u8> {
    pe64_image(
        0x3000,
        &[
            TestSection {
                name: b".text",
                virtual_address: 0x1000,
                size: 0x800,
                characteristics: 0x6000_0020, // code | execute | read
            },
            TestSection {
                name: b".rdata",
                virtual_address: 0x2000,
                size: 0x800,
                characteristics: 0x4000_0040, // initialized data | read
            },
        ],
    )
}

/// Adds an export directory to a [`two_section_pe64`] blob, placed in `.rdata`.
///
/// Layout:
///   directory          0x2000 (size 0x200, so 0x2000..0x2200 is forwarder range)
///   function table     0x2028: ord 5 "Alpha"=0x1100, 6 "Beta"=0x1200,
///                              7 forwarder string at 0x2150, 8 empty
///   name table         0x2038: Alpha, Beta, Fwd (sorted)
///   name-ordinal table 0x2044: 0, 1, 2
pub(crate) fn export_image(forwarder: &str) -> Vec<u8> {
    let mut data = two_section_pe64();
    set_directory(&mut data, crate::pe::constants::DIRECTORY_ENTRY_EXPORT, 0x2000, 0x200);

    put_u32(&mut data, 0x2010, 5); // ordinal base
    put_u32(&mut data, 0x2014, 4); // number of functions
    put_u32(&mut data, 0x2018, 3); // number of names
    put_u32(&mut data, 0x201C, 0x2028); // functions
    put_u32(&mut data, 0x2020, 0x2038); // names
    put_u32(&mut data, 0x2024, 0x2044); // name ordinals

    put_u32(&mut data, 0x2028, 0x1100);
    put_u32(&mut data, 0x202C, 0x1200);
    put_u32(&mut data, 0x2030, 0x2150);
    put_u32(&mut data, 0x2034, 0);

    put_u32(&mut data, 0x2038, 0x2060);
    put_u32(&mut data, 0x203C, 0x2070);
    put_u32(&mut data, 0x2040, 0x2080);

    put_u16(&mut data, 0x2044, 0);
    put_u16(&mut data, 0x2046, 1);
    put_u16(&mut data, 0x2048, 2);

    data[0x2060..0x2065].copy_from_slice(b"Alpha");
    data[0x2070..0x2074].copy_from_slice(b"Beta");
    data[0x2080..0x2083].copy_from_slice(b"Fwd");

    data[0x2150..0x2150 + forwarder.len()].copy_from_slice(forwarder.as_bytes());

    data
}

/// Wraps a virtual-layout blob in a [`MappedImage`] without the file mapper.
pub(crate) fn mapped(data: Vec<u8>) -> MappedImage {
    let headers = ImageHeaders::parse(&data).expect("test image must parse");
    MappedImage::new(data, headers, PathBuf::from("test.dll"))
}

/// Maps [`two_section_pe64`].
pub(crate) fn mapped_two_sections() -> MappedImage {
    mapped(two_section_pe64())
}
