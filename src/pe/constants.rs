//! PE/COFF constants and flag words used by the loader.
//!
//! Values are bit-exact per the Microsoft PE/COFF specification. Only the subset the
//! loader consumes is defined here: header signatures, machine and subsystem types,
//! data-directory indices, base-relocation types, import thunk encodings and the
//! load-configuration guard flags.

use bitflags::bitflags;

/// DOS header signature, `MZ`.
pub const DOS_SIGNATURE: u16 = 0x5A4D;
/// NT headers signature, `PE\0\0`.
pub const NT_SIGNATURE: u32 = 0x0000_4550;
/// Optional header magic for PE32 images.
pub const OPTIONAL_MAGIC_PE32: u16 = 0x010B;
/// Optional header magic for PE32+ images.
pub const OPTIONAL_MAGIC_PE64: u16 = 0x020B;

/// File offset of `e_lfanew` within the DOS header.
pub const DOS_LFANEW_OFFSET: u32 = 0x3C;

/// x86 machine type.
pub const MACHINE_I386: u16 = 0x014C;
/// x64 machine type.
pub const MACHINE_AMD64: u16 = 0x8664;
/// ARM64 machine type.
pub const MACHINE_ARM64: u16 = 0xAA64;

/// Windows GUI subsystem; the only subsystem plugin images may declare.
pub const SUBSYSTEM_WINDOWS_GUI: u16 = 2;

/// Export directory index.
pub const DIRECTORY_ENTRY_EXPORT: usize = 0;
/// Import directory index.
pub const DIRECTORY_ENTRY_IMPORT: usize = 1;
/// Base-relocation directory index.
pub const DIRECTORY_ENTRY_BASERELOC: usize = 5;
/// Load-configuration directory index.
pub const DIRECTORY_ENTRY_LOAD_CONFIG: usize = 10;
/// Delay-import directory index.
pub const DIRECTORY_ENTRY_DELAY_IMPORT: usize = 13;
/// Number of data-directory slots in the optional header.
pub const DIRECTORY_ENTRY_COUNT: usize = 16;

/// Relocation record: no fixup, used as block padding.
pub const REL_BASED_ABSOLUTE: u16 = 0;
/// Relocation record: add the low 16 bits of the delta to a 16-bit field.
pub const REL_BASED_LOW: u16 = 2;
/// Relocation record: add the 32-bit delta to a 32-bit field.
pub const REL_BASED_HIGHLOW: u16 = 3;
/// Relocation record: add the 64-bit delta to a 64-bit field.
pub const REL_BASED_DIR64: u16 = 10;

/// Ordinal-import flag in a PE32 thunk.
pub const ORDINAL_FLAG32: u32 = 0x8000_0000;
/// Ordinal-import flag in a PE32+ thunk.
pub const ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

/// Load-config guard flag: the image carries export-suppression information.
pub const GUARD_CF_EXPORT_SUPPRESSION_INFO_PRESENT: u32 = 0x0000_4000;

/// Size of `IMAGE_EXPORT_DIRECTORY` in bytes.
pub const EXPORT_DIRECTORY_SIZE: usize = 40;
/// Size of `IMAGE_IMPORT_DESCRIPTOR` in bytes.
pub const IMPORT_DESCRIPTOR_SIZE: usize = 20;
/// Size of `IMAGE_DELAYLOAD_DESCRIPTOR` in bytes.
pub const DELAY_DESCRIPTOR_SIZE: usize = 32;
/// Size of an `IMAGE_BASE_RELOCATION` block header in bytes.
pub const RELOCATION_BLOCK_HEADER_SIZE: usize = 8;
/// Size of an `IMAGE_SECTION_HEADER` in bytes.
pub const SECTION_HEADER_SIZE: usize = 40;

bitflags! {
    /// COFF file header characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileCharacteristics: u16 {
        /// Base relocations were stripped at link time.
        const RELOCS_STRIPPED = 0x0001;
        /// The image is executable.
        const EXECUTABLE_IMAGE = 0x0002;
        /// The image is a DLL.
        const DLL = 0x2000;
    }
}

bitflags! {
    /// Section header characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionCharacteristics: u32 {
        /// The section contains code.
        const CNT_CODE = 0x0000_0020;
        /// The section contains initialized data.
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data.
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// The section can be discarded after load.
        const MEM_DISCARDABLE = 0x0200_0000;
        /// The section is executable.
        const MEM_EXECUTE = 0x2000_0000;
        /// The section is readable.
        const MEM_READ = 0x4000_0000;
        /// The section is writable.
        const MEM_WRITE = 0x8000_0000;
    }
}

bitflags! {
    /// Page protection state tracked per mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProtection: u8 {
        /// The region may be read.
        const READ = 0b001;
        /// The region may be written.
        const WRITE = 0b010;
        /// The region may be executed.
        const EXECUTE = 0b100;
    }
}

impl SectionCharacteristics {
    /// Maps section characteristics to the page protection the section carries
    /// once the load sequence has finished with it.
    ///
    /// The mapping mirrors the protection-restore pass of the relocation engine:
    /// read, write and execute combine in the obvious way, with write implying
    /// read (PE sections are never write-only).
    #[must_use]
    pub fn page_protection(&self) -> PageProtection {
        let mut protection = PageProtection::empty();

        if self.contains(SectionCharacteristics::MEM_READ) {
            protection |= PageProtection::READ;
        }
        if self.contains(SectionCharacteristics::MEM_WRITE) {
            protection |= PageProtection::READ | PageProtection::WRITE;
        }
        if self.contains(SectionCharacteristics::MEM_EXECUTE) {
            protection |= PageProtection::EXECUTE;
        }

        protection
    }
}
