//! The plugin load orchestrator and the context-level public operations.
//!
//! A load walks the state machine `Unloaded -> Mapped -> Relocated ->
//! ImportsBound -> DelayImportsBound -> Attached`; the first failing transition
//! unwinds everything. Before a module is registered its mapping is owned
//! exclusively by the sequence, so rollback is simply dropping it: nothing is
//! ever registered, and the entry point has not run unless attach succeeded.
//! The entry point is only invoked with the detach reason if the attach reason
//! was delivered successfully.

use std::path::Path;

use log::{debug, warn};

use crate::{
    host::LifecycleReason,
    loader::{delay, imports, relocs, LoadedModule, LoaderContext},
    Result, Va,
};

/// Progress of one plugin load sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Nothing has happened yet.
    Unloaded,
    /// The file is validated and mapped in virtual layout.
    Mapped,
    /// Base relocations are applied (or were not needed).
    Relocated,
    /// The import directory is fully bound.
    ImportsBound,
    /// Delay imports against the host are bound.
    DelayImportsBound,
    /// The entry point accepted the attach; terminal success.
    Attached,
    /// The sequence failed and was rolled back; terminal.
    Failed,
}

impl LoaderContext {
    /// Loads a plugin image and attaches it to the process.
    ///
    /// Runs the full sequence under the loader sequence lock and returns the
    /// module's base address. On failure nothing remains: the mapping is
    /// released, no directory entry exists, and the entry point has not been
    /// attached.
    ///
    /// # Errors
    ///
    /// Any mapping, relocation, binding or entry-point error of the sequence;
    /// [`crate::Error::EntryPointNotFound`] if the image declares no entry
    /// point and [`crate::Error::EntryPoint`] if it declines the attach.
    pub fn load_plugin_image(&self, path: &Path) -> Result<Va> {
        let _sequence = lock!(self.sequence);

        let mut state = LoadState::Unloaded;
        let result = self.drive_load(path, &mut state);

        match &result {
            Ok(base) => debug!("loaded plugin {} at {:#x}", path.display(), base),
            Err(error) => {
                warn!(
                    "plugin load of {} failed in state {:?}: {}",
                    path.display(),
                    state,
                    error
                );
            }
        }

        result
    }

    fn drive_load(&self, path: &Path, state: &mut LoadState) -> Result<Va> {
        let mut image = self.mapper.map_file(path)?;
        *state = LoadState::Mapped;

        relocs::relocate_image(&mut image, self.host())?;
        *state = LoadState::Relocated;

        imports::bind_imports(self, &mut image)?;
        *state = LoadState::ImportsBound;

        delay::bind_delay_imports(self, &mut image, &self.host_import_name)?;
        *state = LoadState::DelayImportsBound;

        let entry_rva = image.headers().entry_point;
        if entry_rva == 0 {
            *state = LoadState::Failed;
            return Err(crate::Error::EntryPointNotFound);
        }

        let entry_va = image.rva_to_va(entry_rva);
        let attached = self
            .host
            .invoke_entry(image.base(), entry_va, LifecycleReason::Attach)?;
        if !attached {
            *state = LoadState::Failed;
            return Err(crate::Error::EntryPoint);
        }
        *state = LoadState::Attached;

        let module = self.register(LoadedModule::new(image));
        Ok(module.base())
    }

    /// Detaches and unloads the plugin at `base`.
    ///
    /// The detach reason is delivered to the entry point first; its outcome does
    /// not keep the module loaded. The mapping is released once the last
    /// outstanding snapshot of the module drops.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ModuleNotLoaded`] if `base` is not a loaded
    /// plugin (the host image cannot be unloaded).
    pub fn unload_plugin_image(&self, base: Va) -> Result<()> {
        let _sequence = lock!(self.sequence);

        if base == self.host_base {
            return Err(crate::Error::ModuleNotLoaded(self.host_import_name.clone()));
        }

        let module = self.unregister(base)?;

        let entry_rva = module.image().headers().entry_point;
        if entry_rva != 0 {
            let entry_va = module.image().rva_to_va(entry_rva);
            if let Err(error) = self
                .host
                .invoke_entry(base, entry_va, LifecycleReason::Detach)
            {
                warn!("detach of {} failed: {}", module.base_name(), error);
            }
        }

        debug!("unloaded plugin {} from {:#x}", module.base_name(), base);
        Ok(())
    }

    /// Runs the delay-import binder for one dependency of an already-loaded
    /// module.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ModuleNotLoaded`] if `base` is not loaded, and
    /// the delay binder's errors otherwise.
    pub fn bind_delay_imports_for(&self, base: Va, target: &str) -> Result<()> {
        let _sequence = lock!(self.sequence);

        let module = self
            .find_by_base(base)
            .ok_or_else(|| crate::Error::ModuleNotLoaded(format!("{base:#x}")))?;
        let mut image = module.image_mut();

        delay::bind_delay_imports(self, &mut image, target)
    }

    /// Replaces one resolved IAT slot of an already-loaded module.
    ///
    /// Returns the previous address of the slot.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ModuleNotLoaded`] if `base` is not loaded and
    /// [`crate::Error::NotFound`] if the module does not import `procedure`
    /// from `module_name`.
    pub fn detour_import_procedure(
        &self,
        base: Va,
        module_name: &str,
        procedure: &str,
        new_va: Va,
    ) -> Result<Va> {
        let _sequence = lock!(self.sequence);

        let module = self
            .find_by_base(base)
            .ok_or_else(|| crate::Error::ModuleNotLoaded(format!("{base:#x}")))?;
        let mut image = module.image_mut();

        imports::detour_import_procedure(&mut image, module_name, procedure, new_va)
    }
}
