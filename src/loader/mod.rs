//! The loader context, the module directory and its lookup operations.
//!
//! [`LoaderContext`] replaces the ambient global state a native loader keeps: it
//! owns the directory of loaded modules behind a mutex, the process-wide
//! suppressed-call grant cache, and the sequence lock that serializes whole load
//! and unload sequences. Callers hold no locks themselves; every lookup takes the
//! table mutex briefly and returns an [`Arc`] snapshot of the entry.
//!
//! Lock discipline: the sequence lock is taken only by the public entry points
//! (`load_plugin_image`, `unload_plugin_image`, the procedure-address queries and
//! the on-demand delay binder) and is never taken by internal resolution code, so
//! a forwarder chain that loads a dependency mid-resolution cannot deadlock.

pub mod delay;
pub mod exports;
pub mod imports;
pub mod plugin;
pub mod relocs;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use dashmap::DashMap;
use log::debug;

use crate::{
    host::HostEnv,
    image::{ImageMapper, MappedImage},
    loader::exports::Symbol,
    Result, Va,
};

/// Longest forwarder chain the export resolver will follow.
pub(crate) const MAX_FORWARD_DEPTH: usize = 32;

/// Hashes a module base name with the X65599 rolling hash, case-folded.
///
/// Matches the hash the directory stores per entry, so by-name lookups can
/// compare a single integer per module before falling back to a string compare.
#[must_use]
pub fn base_name_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in name.bytes() {
        hash = hash
            .wrapping_mul(65599)
            .wrapping_add(u32::from(byte.to_ascii_uppercase()));
    }
    hash
}

fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// One loaded module: its mapped image plus the identity the directory indexes.
///
/// The image sits behind an `RwLock`: export resolution takes shared reads,
/// while the on-demand delay binder and the IAT detour take the write side. The
/// base address and size are captured at registration; the image's heap
/// allocation never moves, so they stay valid for the module's lifetime.
#[derive(Debug)]
pub struct LoadedModule {
    image: RwLock<MappedImage>,
    base: Va,
    size: u32,
    full_path: PathBuf,
    base_name: String,
    name_hash: u32,
}

impl LoadedModule {
    pub(crate) fn new(image: MappedImage) -> LoadedModule {
        let full_path = image.path().to_path_buf();
        let base_name = full_path
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned());

        LoadedModule {
            base: image.base(),
            size: image.size(),
            name_hash: base_name_hash(&base_name),
            image: RwLock::new(image),
            full_path,
            base_name,
        }
    }

    /// Returns the module's base address.
    #[must_use]
    pub fn base(&self) -> Va {
        self.base
    }

    /// Returns the module's mapped size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the full path the module was loaded from.
    #[must_use]
    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    /// Returns the module's base name.
    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Returns the precomputed hash of the base name.
    #[must_use]
    pub fn name_hash(&self) -> u32 {
        self.name_hash
    }

    /// Returns `true` if `va` falls within the module's mapped range.
    #[must_use]
    pub fn contains_va(&self, va: Va) -> bool {
        va >= self.base && va - self.base < u64::from(self.size)
    }

    /// Returns shared read access to the mapped image.
    pub fn image(&self) -> RwLockReadGuard<'_, MappedImage> {
        read_lock!(self.image)
    }

    pub(crate) fn image_mut(&self) -> RwLockWriteGuard<'_, MappedImage> {
        write_lock!(self.image)
    }
}

struct TableEntry {
    module: Arc<LoadedModule>,
    load_count: u32,
}

/// The loader engine: module directory, grant cache and load sequencing.
///
/// Constructed once per process around the host image (registered under its
/// canonical import name, since the on-disk host binary may have been renamed)
/// and a [`HostEnv`] implementation.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use peload::{ImageMapper, LoaderContext, ProcessHost};
///
/// let mapper = ImageMapper::host();
/// let host_image = mapper.map_file("host.exe".as_ref())?;
/// let loader = LoaderContext::new(Arc::new(ProcessHost::new()), mapper, host_image, "host.exe");
///
/// let base = loader.load_plugin_image("plugin.dll".as_ref())?;
/// loader.unload_plugin_image(base)?;
/// # Ok::<(), peload::Error>(())
/// ```
pub struct LoaderContext {
    host: Arc<dyn HostEnv>,
    mapper: ImageMapper,
    host_import_name: String,
    host_base: Va,
    modules: Mutex<Vec<TableEntry>>,
    granted: DashMap<Va, ()>,
    sequence: Mutex<()>,
}

impl LoaderContext {
    /// Creates a loader around the host image.
    ///
    /// `host_import_name` is the module name plugin images use to import from
    /// the host; imports of that name bind to `host_image` regardless of the
    /// file name the host was mapped from.
    #[must_use]
    pub fn new(
        host: Arc<dyn HostEnv>,
        mapper: ImageMapper,
        host_image: MappedImage,
        host_import_name: impl Into<String>,
    ) -> LoaderContext {
        let host_module = Arc::new(LoadedModule::new(host_image));
        let host_base = host_module.base();

        LoaderContext {
            host,
            mapper,
            host_import_name: host_import_name.into(),
            host_base,
            modules: Mutex::new(vec![TableEntry {
                module: host_module,
                load_count: 1,
            }]),
            granted: DashMap::new(),
            sequence: Mutex::new(()),
        }
    }

    pub(crate) fn host(&self) -> &dyn HostEnv {
        self.host.as_ref()
    }

    pub(crate) fn mapper(&self) -> &ImageMapper {
        &self.mapper
    }

    /// Returns the canonical import name of the host image.
    #[must_use]
    pub fn host_import_name(&self) -> &str {
        &self.host_import_name
    }

    /// Returns the base address of the host image.
    #[must_use]
    pub fn host_base(&self) -> Va {
        self.host_base
    }

    /// Returns the module loaded at exactly `base`.
    #[must_use]
    pub fn find_by_base(&self, base: Va) -> Option<Arc<LoadedModule>> {
        let modules = lock!(self.modules);
        modules
            .iter()
            .find(|entry| entry.module.base() == base)
            .map(|entry| Arc::clone(&entry.module))
    }

    /// Returns the module whose mapped range contains `va`.
    #[must_use]
    pub fn find_by_address(&self, va: Va) -> Option<Arc<LoadedModule>> {
        let modules = lock!(self.modules);
        modules
            .iter()
            .find(|entry| entry.module.contains_va(va))
            .map(|entry| Arc::clone(&entry.module))
    }

    /// Returns the first module matching the supplied names.
    ///
    /// Matching is a case-insensitive prefix match against the full path and the
    /// base name respectively; a `None` criterion is a wildcard. Both criteria
    /// `None` matches nothing.
    #[must_use]
    pub fn find_by_name(
        &self,
        full_name: Option<&str>,
        base_name: Option<&str>,
    ) -> Option<Arc<LoadedModule>> {
        if full_name.is_none() && base_name.is_none() {
            return None;
        }

        let modules = lock!(self.modules);
        modules
            .iter()
            .find(|entry| {
                let full_matches = full_name.is_none_or(|name| {
                    starts_with_ignore_case(&entry.module.full_path().to_string_lossy(), name)
                });
                let base_matches = base_name
                    .is_none_or(|name| starts_with_ignore_case(entry.module.base_name(), name));

                full_matches && base_matches
            })
            .map(|entry| Arc::clone(&entry.module))
    }

    /// Returns the first module whose precomputed name hash equals `hash`.
    #[must_use]
    pub fn find_by_name_hash(&self, hash: u32) -> Option<Arc<LoadedModule>> {
        let modules = lock!(self.modules);
        modules
            .iter()
            .find(|entry| entry.module.name_hash() == hash)
            .map(|entry| Arc::clone(&entry.module))
    }

    /// Returns the base address of the module with the given base name.
    ///
    /// The hash index is consulted first; a hash hit is verified with a string
    /// compare before it is trusted.
    #[must_use]
    pub fn module_base(&self, base_name: &str) -> Option<Va> {
        if let Some(module) = self.find_by_name_hash(base_name_hash(base_name)) {
            if module.base_name().eq_ignore_ascii_case(base_name) {
                return Some(module.base());
            }
        }

        self.find_by_name(None, Some(base_name))
            .map(|module| module.base())
    }

    /// Returns the file path of the module loaded at `base`.
    #[must_use]
    pub fn module_file_name(&self, base: Va) -> Option<PathBuf> {
        self.find_by_base(base)
            .map(|module| module.full_path().to_path_buf())
    }

    /// Resolves a symbol from the module with the given base name.
    ///
    /// The whole query runs under the sequence lock, like a load.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ModuleNotLoaded`] if no such module is loaded and
    /// the resolver's errors otherwise.
    pub fn procedure_address(&self, module_name: &str, symbol: Symbol<'_>) -> Result<Va> {
        let _sequence = lock!(self.sequence);
        let base = self
            .module_base(module_name)
            .ok_or_else(|| crate::Error::ModuleNotLoaded(module_name.to_string()))?;

        self.resolve_at(base, symbol)
    }

    /// Resolves a symbol from the module loaded at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ModuleNotLoaded`] if no module is loaded at
    /// `base` and the resolver's errors otherwise.
    pub fn procedure_address_at(&self, base: Va, symbol: Symbol<'_>) -> Result<Va> {
        let _sequence = lock!(self.sequence);
        self.resolve_at(base, symbol)
    }

    fn resolve_at(&self, base: Va, symbol: Symbol<'_>) -> Result<Va> {
        let module = self
            .find_by_base(base)
            .ok_or_else(|| crate::Error::ModuleNotLoaded(format!("{base:#x}")))?;

        exports::resolve_export(self, &module, symbol, None)
    }

    /// Loads (or reuses) a dependency module by name.
    ///
    /// The host import name binds to the host image without touching load
    /// counts. An already-loaded module's load count is bumped; otherwise the
    /// file is located through the host search order, mapped and registered. A
    /// name without an extension gets `.dll` appended first.
    pub(crate) fn load_dependency(&self, name: &str) -> Result<Arc<LoadedModule>> {
        if name.eq_ignore_ascii_case(&self.host_import_name) {
            return self
                .find_by_base(self.host_base)
                .ok_or_else(|| crate::Error::ModuleNotLoaded(name.to_string()));
        }

        let file_name = if Path::new(name).extension().is_some() {
            name.to_string()
        } else {
            format!("{name}.dll")
        };

        {
            let mut modules = lock!(self.modules);
            if let Some(entry) = modules
                .iter_mut()
                .find(|entry| entry.module.base_name().eq_ignore_ascii_case(&file_name))
            {
                entry.load_count += 1;
                return Ok(Arc::clone(&entry.module));
            }
        }

        let path = self
            .host
            .locate_module(&file_name)
            .ok_or_else(|| crate::Error::ModuleNotLoaded(file_name.clone()))?;
        let image = self.mapper.map_file(&path)?;
        let module = Arc::new(LoadedModule::new(image));

        debug!("loaded dependency {} at {:#x}", file_name, module.base());

        let mut modules = lock!(self.modules);
        modules.push(TableEntry {
            module: Arc::clone(&module),
            load_count: 1,
        });

        Ok(module)
    }

    /// Releases one reference to a dependency module.
    ///
    /// The host image is never released. A module whose load count reaches zero
    /// is removed from the directory; its mapping is unmapped once the last
    /// outstanding snapshot drops.
    pub(crate) fn free_dependency(&self, base: Va) {
        if base == self.host_base {
            return;
        }

        let mut modules = lock!(self.modules);
        if let Some(index) = modules
            .iter()
            .position(|entry| entry.module.base() == base)
        {
            modules[index].load_count -= 1;
            if modules[index].load_count == 0 {
                let entry = modules.swap_remove(index);
                debug!("unloading {} from {:#x}", entry.module.base_name(), base);
            }
        }
    }

    /// Registers a fully loaded module in the directory.
    pub(crate) fn register(&self, module: LoadedModule) -> Arc<LoadedModule> {
        let module = Arc::new(module);
        let mut modules = lock!(self.modules);

        // One entry per base address; bases are distinct allocations, so a
        // duplicate would mean a module was registered twice.
        debug_assert!(
            !modules
                .iter()
                .any(|entry| entry.module.base() == module.base())
        );

        modules.push(TableEntry {
            module: Arc::clone(&module),
            load_count: 1,
        });

        module
    }

    /// Removes the module at `base` from the directory.
    pub(crate) fn unregister(&self, base: Va) -> Result<Arc<LoadedModule>> {
        let mut modules = lock!(self.modules);
        let index = modules
            .iter()
            .position(|entry| entry.module.base() == base)
            .ok_or_else(|| crate::Error::ModuleNotLoaded(format!("{base:#x}")))?;

        Ok(modules.swap_remove(index).module)
    }

    /// Grants suppressed-call access for `va` if the exporting image requires it.
    ///
    /// Grants are cached process-wide; a successful privileged host call runs at
    /// most once per distinct address. A failed grant is not cached, so a later
    /// resolution of the same address retries it.
    pub(crate) fn maybe_grant(&self, guard_flags: u32, va: Va) -> Result<()> {
        use crate::pe::constants::GUARD_CF_EXPORT_SUPPRESSION_INFO_PRESENT;

        if !self.host.guard_enforced() {
            return Ok(());
        }
        if guard_flags & GUARD_CF_EXPORT_SUPPRESSION_INFO_PRESENT == 0 {
            return Ok(());
        }
        if self.granted.contains_key(&va) {
            return Ok(());
        }

        self.host.grant_suppressed_call(va)?;
        self.granted.insert(va, ());
        Ok(())
    }
}
