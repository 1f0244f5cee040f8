//! Import binding: resolve the import directory and fill the IAT.
//!
//! Resolution and writing are separate phases. Every thunk of every descriptor
//! is resolved first (fanned out on the rayon pool per descriptor), and only
//! once the whole directory has resolved does a single protection window open
//! for the IAT writes. The structural join of the fan-out therefore precedes
//! every write and the window's restore, and a failed bind leaves the image
//! byte-for-byte untouched.

use log::{debug, warn};
use rayon::prelude::*;

use crate::{
    image::MappedImage,
    loader::{
        exports::{export_name_from_ordinal, resolve_export, Symbol},
        LoadedModule, LoaderContext,
    },
    pe::{
        constants::{DIRECTORY_ENTRY_IMPORT, IMPORT_DESCRIPTOR_SIZE, ORDINAL_FLAG32, ORDINAL_FLAG64},
        headers::DataDirectory,
        view::ImageView,
    },
    Result, Rva, Va,
};

/// One import thunk, decoded from the original (lookup) thunk array.
#[derive(Debug)]
pub(crate) enum ThunkImport {
    /// Import by export ordinal.
    Ordinal(u16),
    /// Import by name, with the linker-recorded name-table hint.
    Name {
        hint: u16,
        name: String,
    },
}

impl ThunkImport {
    pub(crate) fn symbol(&self) -> Symbol<'_> {
        match self {
            ThunkImport::Ordinal(ordinal) => Symbol::Ordinal(*ordinal),
            ThunkImport::Name { name, .. } => Symbol::Name(name),
        }
    }

    pub(crate) fn hint(&self) -> Option<u16> {
        match self {
            ThunkImport::Ordinal(_) => None,
            ThunkImport::Name { hint, .. } => Some(*hint),
        }
    }
}

pub(crate) struct ImportDescriptor {
    pub(crate) module_name: String,
    lookup_rva: Rva,
    iat_rva: Rva,
}

/// Reads the import descriptor array up to its all-zero terminator.
pub(crate) fn read_descriptors(
    view: ImageView<'_>,
    directory: &DataDirectory,
) -> Result<Vec<ImportDescriptor>> {
    let mut descriptors = Vec::new();

    for index in 0.. {
        let offset = index * IMPORT_DESCRIPTOR_SIZE as u32;
        if u64::from(offset) + IMPORT_DESCRIPTOR_SIZE as u64 > u64::from(directory.size) {
            return Err(image_error!("import directory is missing its terminator"));
        }

        let entry = directory.virtual_address + offset;
        let original_first_thunk = view.read_u32(entry)?;
        let name_rva = view.read_u32(entry + 12)?;
        let iat_rva = view.read_u32(entry + 16)?;

        if name_rva == 0 {
            break;
        }

        descriptors.push(ImportDescriptor {
            module_name: view.read_cstr(name_rva)?.to_string(),
            // old linkers leave the lookup array out and double up the IAT
            lookup_rva: if original_first_thunk != 0 {
                original_first_thunk
            } else {
                iat_rva
            },
            iat_rva,
        });
    }

    Ok(descriptors)
}

/// Decodes a thunk array until its zero terminator.
pub(crate) fn parse_thunks(
    view: ImageView<'_>,
    pe64: bool,
    lookup_rva: Rva,
) -> Result<Vec<ThunkImport>> {
    let mut thunks = Vec::new();

    for index in 0.. {
        let (value, by_ordinal) = if pe64 {
            let raw = view.read_u64(lookup_rva + index * 8)?;
            (raw & !ORDINAL_FLAG64, raw & ORDINAL_FLAG64 != 0)
        } else {
            let raw = view.read_u32(lookup_rva + index * 4)?;
            (u64::from(raw & !ORDINAL_FLAG32), raw & ORDINAL_FLAG32 != 0)
        };

        if value == 0 && !by_ordinal {
            break;
        }

        if by_ordinal {
            thunks.push(ThunkImport::Ordinal((value & 0xFFFF) as u16));
        } else {
            let hint_name_rva = value as Rva;
            thunks.push(ThunkImport::Name {
                hint: view.read_u16(hint_name_rva)?,
                name: view.read_cstr(hint_name_rva + 2)?.to_string(),
            });
        }
    }

    Ok(thunks)
}

fn import_failure(dependency: &LoadedModule, module_name: &str, thunk: &ThunkImport) -> crate::Error {
    let symbol = match thunk {
        ThunkImport::Name { name, .. } => name.clone(),
        ThunkImport::Ordinal(ordinal) => {
            // the ordinal may still carry a name in the dependency's tables
            match export_name_from_ordinal(&dependency.image(), *ordinal) {
                Some(name) => format!("{name} (#{ordinal})"),
                None => format!("#{ordinal}"),
            }
        }
    };

    warn!("unable to resolve import {symbol} from {module_name}");
    crate::Error::ImportResolution {
        module: module_name.to_string(),
        symbol,
    }
}

/// Binds the image's import directory, writing every resolved IAT slot.
///
/// An image without an import directory succeeds trivially. The first
/// unresolvable import aborts the bind before anything is written.
///
/// # Errors
///
/// Returns [`crate::Error::ImportResolution`] for an unresolvable symbol,
/// [`crate::Error::ModuleNotLoaded`] when a dependency cannot be located, and
/// [`crate::Error::ImageFormat`] for malformed directory structures.
pub(crate) fn bind_imports(ctx: &LoaderContext, image: &mut MappedImage) -> Result<()> {
    let Some(directory) = image.headers().directory(DIRECTORY_ENTRY_IMPORT).copied() else {
        return Ok(());
    };
    let pe64 = image.headers().pe64;
    let slot_size: u32 = if pe64 { 8 } else { 4 };

    let descriptors = read_descriptors(image.view(), &directory)?;
    let mut writes: Vec<(Rva, Va)> = Vec::new();

    for descriptor in &descriptors {
        let dependency = ctx.load_dependency(&descriptor.module_name)?;
        let thunks = parse_thunks(image.view(), pe64, descriptor.lookup_rva)?;

        debug!(
            "binding {} imports from {}",
            thunks.len(),
            descriptor.module_name
        );

        let resolved: Vec<Result<Va>> = thunks
            .par_iter()
            .map(|thunk| resolve_export(ctx, &dependency, thunk.symbol(), thunk.hint()))
            .collect();

        for (index, result) in resolved.into_iter().enumerate() {
            let va = result
                .map_err(|_| import_failure(&dependency, &descriptor.module_name, &thunks[index]))?;
            writes.push((descriptor.iat_rva + index as u32 * slot_size, va));
        }
    }

    if writes.is_empty() {
        return Ok(());
    }

    let span_start = writes.iter().map(|(rva, _)| *rva).min().unwrap_or(0);
    let span_end = writes
        .iter()
        .map(|(rva, _)| rva + slot_size)
        .max()
        .unwrap_or(0);

    let mut guard = image.elevate_region(span_start, span_end - span_start)?;
    for (slot, va) in writes {
        if pe64 {
            guard.write_u64(slot, va)?;
        } else {
            guard.write_u32(slot, va as u32)?;
        }
    }

    Ok(())
}

/// Replaces one resolved IAT slot of an already-bound image.
///
/// Finds the import of `procedure` from `module_name`, swaps in `new_va` under
/// a protection window and returns the previous address.
///
/// # Errors
///
/// Returns [`crate::Error::NotFound`] if the image does not import that
/// procedure from that module.
pub fn detour_import_procedure(
    image: &mut MappedImage,
    module_name: &str,
    procedure: &str,
    new_va: Va,
) -> Result<Va> {
    let Some(directory) = image.headers().directory(DIRECTORY_ENTRY_IMPORT).copied() else {
        return Err(crate::Error::NotFound(procedure.to_string()));
    };
    let pe64 = image.headers().pe64;
    let slot_size: u32 = if pe64 { 8 } else { 4 };

    for descriptor in read_descriptors(image.view(), &directory)? {
        if !descriptor.module_name.eq_ignore_ascii_case(module_name) {
            continue;
        }

        let thunks = parse_thunks(image.view(), pe64, descriptor.lookup_rva)?;
        for (index, thunk) in thunks.iter().enumerate() {
            let ThunkImport::Name { name, .. } = thunk else {
                continue;
            };
            if name != procedure {
                continue;
            }

            let slot = descriptor.iat_rva + index as u32 * slot_size;
            let previous = if pe64 {
                image.view().read_u64(slot)?
            } else {
                u64::from(image.view().read_u32(slot)?)
            };

            let mut guard = image.elevate_region(slot, slot_size)?;
            if pe64 {
                guard.write_u64(slot, new_va)?;
            } else {
                guard.write_u32(slot, new_va as u32)?;
            }

            debug!("detoured {module_name}!{procedure} from {previous:#x} to {new_va:#x}");
            return Ok(previous);
        }
    }

    Err(crate::Error::NotFound(procedure.to_string()))
}
