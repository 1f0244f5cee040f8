//! Shared builders for the integration suite.
//!
//! Builds synthetic PE32+ images whose raw section data sits at the virtual
//! addresses, so the same blob is valid both on disk and mapped. The host image
//! exports `Bar` (#5) and `Foo` (#6); plugin blobs get import, delay-import and
//! relocation directories patched in as each test needs.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use peload::{
    pe::constants::{
        DIRECTORY_ENTRY_BASERELOC, DIRECTORY_ENTRY_DELAY_IMPORT, DIRECTORY_ENTRY_EXPORT,
        DIRECTORY_ENTRY_IMPORT, DOS_LFANEW_OFFSET, DOS_SIGNATURE, MACHINE_AMD64, NT_SIGNATURE,
        OPTIONAL_MAGIC_PE64, ORDINAL_FLAG64, REL_BASED_DIR64, SUBSYSTEM_WINDOWS_GUI,
    },
    HostEnv, ImageMapper, LifecycleReason, LoaderContext, Result, Va,
};

pub const PREFERRED_BASE: u64 = 0x1_8000_0000;

pub fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn set_directory(data: &mut [u8], index: usize, rva: u32, size: u32) {
    let entry = 0x80 + 4 + 20 + 112 + index * 8;
    put_u32(data, entry, rva);
    put_u32(data, entry + 4, size);
}

/// A 0x3000-byte PE32+ blob: headers, `.text` (RX, 0x1000) and `.rdata`
/// (read-only, 0x2000), entry point 0x1010, preferred base `PREFERRED_BASE`.
pub fn base_image() -> Vec<u8> {
    let mut data = vec![0u8; 0x3000];
    let lfanew = 0x80usize;

    put_u16(&mut data, 0, DOS_SIGNATURE);
    put_u32(&mut data, DOS_LFANEW_OFFSET as usize, lfanew as u32);
    put_u32(&mut data, lfanew, NT_SIGNATURE);

    let coff = lfanew + 4;
    put_u16(&mut data, coff, MACHINE_AMD64);
    put_u16(&mut data, coff + 2, 2);
    put_u16(&mut data, coff + 16, 240);
    put_u16(&mut data, coff + 18, 0x2022); // EXECUTABLE_IMAGE | DLL

    let opt = coff + 20;
    put_u16(&mut data, opt, OPTIONAL_MAGIC_PE64);
    put_u32(&mut data, opt + 16, 0x1010);
    put_u64(&mut data, opt + 24, PREFERRED_BASE);
    put_u32(&mut data, opt + 56, 0x3000);
    put_u32(&mut data, opt + 60, 0x400);
    put_u16(&mut data, opt + 68, SUBSYSTEM_WINDOWS_GUI);
    put_u32(&mut data, opt + 108, 16);

    let mut section = opt + 240;
    for (name, rva, characteristics) in
        [(&b".text"[..], 0x1000u32, 0x6000_0020u32), (&b".rdata"[..], 0x2000, 0x4000_0040)]
    {
        data[section..section + name.len()].copy_from_slice(name);
        put_u32(&mut data, section + 8, 0x800);
        put_u32(&mut data, section + 12, rva);
        put_u32(&mut data, section + 16, 0x800);
        put_u32(&mut data, section + 20, rva);
        put_u32(&mut data, section + 36, characteristics);
        section += 40;
    }

    data
}

/// RVAs of the host's two export targets.
pub const EXPORT_BAR_RVA: u32 = 0x1100;
pub const EXPORT_FOO_RVA: u32 = 0x1200;

/// Adds an export directory: `Bar` = #5 at 0x1100, `Foo` = #6 at 0x1200.
pub fn with_exports(mut data: Vec<u8>) -> Vec<u8> {
    set_directory(&mut data, DIRECTORY_ENTRY_EXPORT, 0x2000, 0x100);

    put_u32(&mut data, 0x2010, 5); // ordinal base
    put_u32(&mut data, 0x2014, 2); // functions
    put_u32(&mut data, 0x2018, 2); // names
    put_u32(&mut data, 0x201C, 0x2028);
    put_u32(&mut data, 0x2020, 0x2030);
    put_u32(&mut data, 0x2024, 0x2038);

    put_u32(&mut data, 0x2028, EXPORT_BAR_RVA);
    put_u32(&mut data, 0x202C, EXPORT_FOO_RVA);
    put_u32(&mut data, 0x2030, 0x2040);
    put_u32(&mut data, 0x2034, 0x2048);
    put_u16(&mut data, 0x2038, 0);
    put_u16(&mut data, 0x203A, 1);

    data[0x2040..0x2043].copy_from_slice(b"Bar");
    data[0x2048..0x204B].copy_from_slice(b"Foo");

    data
}

/// IAT location of blobs built by [`with_host_imports`].
pub const IMPORT_IAT_RVA: u32 = 0x25C0;

/// Adds an import directory importing ordinal `#5` and a named symbol from
/// `host.exe`. The named thunk carries the supplied hint.
pub fn with_host_imports(mut data: Vec<u8>, name: &str, hint: u16) -> Vec<u8> {
    set_directory(&mut data, DIRECTORY_ENTRY_IMPORT, 0x2500, 40);

    put_u32(&mut data, 0x2500, 0x2540); // lookup table
    put_u32(&mut data, 0x250C, 0x2580); // module name
    put_u32(&mut data, 0x2510, IMPORT_IAT_RVA);

    put_u64(&mut data, 0x2540, ORDINAL_FLAG64 | 5);
    put_u64(&mut data, 0x2548, 0x2590);
    put_u64(&mut data, 0x2550, 0);

    data[0x2580..0x2588].copy_from_slice(b"host.exe");
    put_u16(&mut data, 0x2590, hint);
    data[0x2592..0x2592 + name.len()].copy_from_slice(name.as_bytes());

    data
}

/// Handle-slot and IAT locations of blobs built by [`with_delay_imports`].
pub const DELAY_HANDLE_RVA: u32 = 0x2690;
pub const DELAY_IAT_RVA: u32 = 0x26A0;

/// Adds a delay-import directory importing `Foo` from `module_name`.
pub fn with_delay_imports(mut data: Vec<u8>, module_name: &str) -> Vec<u8> {
    set_directory(&mut data, DIRECTORY_ENTRY_DELAY_IMPORT, 0x2600, 64);

    put_u32(&mut data, 0x2600, 1); // attributes: RVA-based
    put_u32(&mut data, 0x2604, 0x2680); // module name
    put_u32(&mut data, 0x2608, DELAY_HANDLE_RVA);
    put_u32(&mut data, 0x260C, DELAY_IAT_RVA);
    put_u32(&mut data, 0x2610, 0x26C0); // name table

    data[0x2680..0x2680 + module_name.len()].copy_from_slice(module_name.as_bytes());
    put_u64(&mut data, 0x26C0, 0x26E0);
    put_u64(&mut data, 0x26C8, 0);
    put_u16(&mut data, 0x26E0, 1);
    data[0x26E2..0x26E5].copy_from_slice(b"Foo");

    data
}

/// RVA whose 8-byte value is relocated by [`with_relocation`].
pub const RELOC_TARGET_RVA: u32 = 0x1400;
pub const RELOC_TARGET_VALUE: u64 = 0x0123_4567_89AB_CDEF;

/// Adds one `DIR64` relocation for the value at [`RELOC_TARGET_RVA`].
pub fn with_relocation(mut data: Vec<u8>) -> Vec<u8> {
    set_directory(&mut data, DIRECTORY_ENTRY_BASERELOC, 0x2700, 12);

    put_u32(&mut data, 0x2700, 0x1000);
    put_u32(&mut data, 0x2704, 12);
    put_u16(&mut data, 0x2708, (REL_BASED_DIR64 << 12) | 0x400);
    put_u16(&mut data, 0x270A, 0); // absolute padding

    put_u64(&mut data, RELOC_TARGET_RVA as usize, RELOC_TARGET_VALUE);

    data
}

/// Marks the image as `relocs_stripped`.
pub fn strip_relocations(mut data: Vec<u8>) -> Vec<u8> {
    put_u16(&mut data, 0x80 + 4 + 18, 0x2023);
    data
}

/// Clears the entry point.
pub fn without_entry_point(mut data: Vec<u8>) -> Vec<u8> {
    put_u32(&mut data, 0x80 + 4 + 20 + 16, 0);
    data
}

/// Test host: serves dependency files from a registry and records every
/// entry-point dispatch instead of calling into the mapped image.
pub struct MockHost {
    files: Mutex<HashMap<String, PathBuf>>,
    events: Mutex<Vec<(Va, LifecycleReason)>>,
    attach_result: Mutex<bool>,
}

impl MockHost {
    pub fn new() -> MockHost {
        MockHost {
            files: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            attach_result: Mutex::new(true),
        }
    }

    pub fn serve(&self, name: &str, path: PathBuf) {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_ascii_lowercase(), path);
    }

    pub fn refuse_attach(&self) {
        *self.attach_result.lock().unwrap() = false;
    }

    pub fn events(&self) -> Vec<(Va, LifecycleReason)> {
        self.events.lock().unwrap().clone()
    }

    pub fn attach_count(&self, base: Va) -> usize {
        self.events()
            .iter()
            .filter(|(b, reason)| *b == base && *reason == LifecycleReason::Attach)
            .count()
    }

    pub fn detach_count(&self, base: Va) -> usize {
        self.events()
            .iter()
            .filter(|(b, reason)| *b == base && *reason == LifecycleReason::Detach)
            .count()
    }
}

impl HostEnv for MockHost {
    fn locate_module(&self, name: &str) -> Option<PathBuf> {
        self.files
            .lock()
            .unwrap()
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    fn invoke_entry(&self, base: Va, _entry: Va, reason: LifecycleReason) -> Result<bool> {
        self.events.lock().unwrap().push((base, reason));
        Ok(*self.attach_result.lock().unwrap() || reason == LifecycleReason::Detach)
    }
}

/// Routes the loader's log output through the test harness capture.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A loader whose host image exports `Bar`/`Foo` under the import name
/// `host.exe`, paired with the [`MockHost`] behind it.
pub fn loader_with_mock_host() -> (LoaderContext, Arc<MockHost>) {
    init_logging();

    let mapper = ImageMapper::new(MACHINE_AMD64);
    let host_image = mapper
        .map_bytes(&with_exports(base_image()), "/opt/app/renamed_host.exe".as_ref())
        .unwrap();

    let mock = Arc::new(MockHost::new());
    let loader = LoaderContext::new(
        Arc::clone(&mock) as Arc<dyn HostEnv>,
        mapper,
        host_image,
        "host.exe",
    );

    (loader, mock)
}

/// Writes a plugin blob into a scratch directory and returns its path.
pub fn write_plugin(dir_name: &str, file_name: &str, data: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join(dir_name);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file_name);
    std::fs::write(&path, data).unwrap();
    path
}

pub fn cleanup(dir_name: &str) {
    std::fs::remove_dir_all(std::env::temp_dir().join(dir_name)).ok();
}

/// Reads a little-endian `u64` out of a loaded module's mapping.
pub fn read_module_u64(loader: &LoaderContext, base: Va, rva: u32) -> u64 {
    let module = loader.find_by_base(base).unwrap();
    let image = module.image();
    image.view().read_u64(rva).unwrap()
}
