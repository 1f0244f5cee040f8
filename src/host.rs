//! The host-process seam of the loader.
//!
//! Everything the load sequence needs from the surrounding process goes through
//! the [`HostEnv`] trait: locating dependency files in the safe search order,
//! dispatching a module's lifecycle entry point, and the control-flow-guard
//! queries. The production implementation is [`ProcessHost`]; tests substitute
//! their own implementation to observe attach/detach calls and to serve
//! dependency files from scratch directories.

use std::path::{Path, PathBuf};

use log::debug;

use crate::{Result, Va};

/// Why a module's entry point is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleReason {
    /// The module is being attached to the process.
    Attach,
    /// The module is being detached from the process.
    Detach,
}

/// Services the loader requires from the host process.
///
/// Implementations must be shareable across threads; the import binder resolves
/// thunks from a thread pool.
pub trait HostEnv: Send + Sync {
    /// Locates the file for a dependency module name.
    ///
    /// The search order is fixed and safe: the system directory first, then the
    /// application directory, then (only when legacy search is enabled) the
    /// working directory. `name` may also be an absolute path, which is used
    /// directly if the file exists.
    fn locate_module(&self, name: &str) -> Option<PathBuf>;

    /// Invokes a module entry point.
    ///
    /// Returns `Ok(true)` if the entry point reported success, `Ok(false)` if it
    /// declined.
    fn invoke_entry(&self, base: Va, entry: Va, reason: LifecycleReason) -> Result<bool>;

    /// Returns `true` if control-flow guard is enforced for this process.
    fn guard_enforced(&self) -> bool {
        false
    }

    /// Makes a suppressed export address a valid indirect-call target.
    ///
    /// Only called when [`HostEnv::guard_enforced`] returns `true`, and at most
    /// once per distinct address.
    fn grant_suppressed_call(&self, va: Va) -> Result<()> {
        let _ = va;
        Ok(())
    }

    /// Flushes the instruction cache after writes to executable memory.
    fn flush_instruction_cache(&self, base: Va, len: u64) {
        let _ = (base, len);
    }
}

/// Production [`HostEnv`] backed by the current process.
///
/// The search directories are captured at construction: the system directory
/// from the environment and the application directory from the running
/// executable's location. Legacy working-directory search is off by default.
pub struct ProcessHost {
    system_dir: Option<PathBuf>,
    application_dir: Option<PathBuf>,
    legacy_search: bool,
}

impl ProcessHost {
    /// Creates a host with directories captured from the current process.
    #[must_use]
    pub fn new() -> ProcessHost {
        let system_dir = std::env::var_os("SystemRoot")
            .or_else(|| std::env::var_os("windir"))
            .map(|root| PathBuf::from(root).join("System32"));
        let application_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));

        ProcessHost {
            system_dir,
            application_dir,
            legacy_search: false,
        }
    }

    /// Overrides the system directory.
    #[must_use]
    pub fn with_system_dir(mut self, dir: PathBuf) -> ProcessHost {
        self.system_dir = Some(dir);
        self
    }

    /// Overrides the application directory.
    #[must_use]
    pub fn with_application_dir(mut self, dir: PathBuf) -> ProcessHost {
        self.application_dir = Some(dir);
        self
    }

    /// Enables the legacy working-directory fallback.
    #[must_use]
    pub fn with_legacy_search(mut self, enabled: bool) -> ProcessHost {
        self.legacy_search = enabled;
        self
    }
}

impl Default for ProcessHost {
    fn default() -> ProcessHost {
        ProcessHost::new()
    }
}

/// DllMain-compatible entry point signature.
type EntryFn = unsafe extern "system" fn(u64, u32, *mut core::ffi::c_void) -> i32;

const PROCESS_DETACH: u32 = 0;
const PROCESS_ATTACH: u32 = 1;

impl HostEnv for ProcessHost {
    fn locate_module(&self, name: &str) -> Option<PathBuf> {
        let direct = Path::new(name);
        if direct.is_absolute() {
            return direct.is_file().then(|| direct.to_path_buf());
        }

        let mut candidates = Vec::with_capacity(3);
        if let Some(system) = &self.system_dir {
            candidates.push(system.join(name));
        }
        if let Some(application) = &self.application_dir {
            candidates.push(application.join(name));
        }
        if self.legacy_search {
            if let Ok(current) = std::env::current_dir() {
                candidates.push(current.join(name));
            }
        }

        let found = candidates.into_iter().find(|candidate| candidate.is_file());
        match &found {
            Some(path) => debug!("located {} at {}", name, path.display()),
            None => debug!("module {} not found in the search order", name),
        }

        found
    }

    fn invoke_entry(&self, base: Va, entry: Va, reason: LifecycleReason) -> Result<bool> {
        let code = match reason {
            LifecycleReason::Attach => PROCESS_ATTACH,
            LifecycleReason::Detach => PROCESS_DETACH,
        };

        // Safety: the caller guarantees `entry` is the entry-point address of an
        // image that has been fully relocated and bound, so it points at valid
        // code with the DllMain calling convention.
        let function = unsafe { std::mem::transmute::<usize, EntryFn>(entry as usize) };
        let status = unsafe { function(base, code, std::ptr::null_mut()) };

        Ok(status != 0)
    }
}
