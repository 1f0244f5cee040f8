//! Delay-import binding for one target module at a time.
//!
//! Delay descriptors carry a module-handle slot that is populated at most once
//! logically: a cached handle is reused, otherwise the module is loaded and the
//! handle installed, and a load that lost the installation race is released
//! again. The binder processes only the descriptors naming the requested target
//! module; the orchestrator calls it once per dependency of interest, normally
//! the host image.

use log::debug;

use crate::{
    image::MappedImage,
    loader::{
        exports::{resolve_export, resolve_export_from_image},
        imports::{parse_thunks, ThunkImport},
        LoaderContext,
    },
    pe::{
        constants::{DELAY_DESCRIPTOR_SIZE, DIRECTORY_ENTRY_DELAY_IMPORT},
        view::ImageView,
    },
    Result, Rva, Va,
};

struct DelayDescriptor {
    module_name: String,
    handle_rva: Rva,
    iat_rva: Rva,
    name_table_rva: Rva,
}

fn read_descriptors(
    view: ImageView<'_>,
    directory_rva: Rva,
    directory_size: u32,
) -> Result<Vec<DelayDescriptor>> {
    let mut descriptors = Vec::new();

    for index in 0.. {
        let offset = index * DELAY_DESCRIPTOR_SIZE as u32;
        if u64::from(offset) + DELAY_DESCRIPTOR_SIZE as u64 > u64::from(directory_size) {
            return Err(image_error!("delay-import directory is missing its terminator"));
        }

        let entry = directory_rva + offset;
        let name_rva = view.read_u32(entry + 4)?;
        if name_rva == 0 {
            break;
        }

        descriptors.push(DelayDescriptor {
            module_name: view.read_cstr(name_rva)?.to_string(),
            handle_rva: view.read_u32(entry + 8)?,
            iat_rva: view.read_u32(entry + 12)?,
            name_table_rva: view.read_u32(entry + 16)?,
        });
    }

    Ok(descriptors)
}

/// Binds every delay-import descriptor naming `target`.
///
/// Descriptors for other modules are left untouched. An image without a
/// delay-import directory succeeds trivially.
///
/// # Errors
///
/// Returns [`crate::Error::ImportResolution`] for an unresolvable symbol,
/// [`crate::Error::ModuleNotLoaded`] when the target cannot be loaded, and
/// [`crate::Error::ImageFormat`] for malformed directory structures.
pub(crate) fn bind_delay_imports(
    ctx: &LoaderContext,
    image: &mut MappedImage,
    target: &str,
) -> Result<()> {
    let Some(directory) = image
        .headers()
        .directory(DIRECTORY_ENTRY_DELAY_IMPORT)
        .copied()
    else {
        return Ok(());
    };
    let pe64 = image.headers().pe64;
    let slot_size: u32 = if pe64 { 8 } else { 4 };

    let descriptors = read_descriptors(image.view(), directory.virtual_address, directory.size)?;
    let matching: Vec<(DelayDescriptor, Vec<ThunkImport>)> = descriptors
        .into_iter()
        .filter(|descriptor| descriptor.module_name.eq_ignore_ascii_case(target))
        .map(|descriptor| {
            let thunks = parse_thunks(image.view(), pe64, descriptor.name_table_rva)?;
            Ok((descriptor, thunks))
        })
        .collect::<Result<_>>()?;

    if matching.is_empty() {
        return Ok(());
    }

    // one window spanning every handle slot and IAT touched by this call
    let mut span_start = u32::MAX;
    let mut span_end = 0u32;
    for (descriptor, thunks) in &matching {
        span_start = span_start.min(descriptor.handle_rva).min(descriptor.iat_rva);
        span_end = span_end
            .max(descriptor.handle_rva + slot_size)
            .max(descriptor.iat_rva + thunks.len() as u32 * slot_size);
    }

    let mut guard = image.elevate_region(span_start, span_end - span_start)?;

    for (descriptor, thunks) in &matching {
        let cached: Va = if pe64 {
            guard.view().read_u64(descriptor.handle_rva)?
        } else {
            u64::from(guard.view().read_u32(descriptor.handle_rva)?)
        };

        let dependency = if cached != 0 {
            ctx.find_by_base(cached)
                .ok_or_else(|| crate::Error::ModuleNotLoaded(descriptor.module_name.clone()))?
        } else {
            let loaded = ctx.load_dependency(&descriptor.module_name)?;

            // install the handle; a concurrent winner keeps its module and ours
            // is released again
            let current: Va = if pe64 {
                guard.view().read_u64(descriptor.handle_rva)?
            } else {
                u64::from(guard.view().read_u32(descriptor.handle_rva)?)
            };
            if current == 0 {
                if pe64 {
                    guard.write_u64(descriptor.handle_rva, loaded.base())?;
                } else {
                    guard.write_u32(descriptor.handle_rva, loaded.base() as u32)?;
                }
                loaded
            } else if current == loaded.base() {
                loaded
            } else {
                ctx.free_dependency(loaded.base());
                ctx.find_by_base(current)
                    .ok_or_else(|| crate::Error::ModuleNotLoaded(descriptor.module_name.clone()))?
            }
        };

        debug!(
            "delay-binding {} thunks from {}",
            thunks.len(),
            descriptor.module_name
        );

        // a descriptor naming the module itself resolves against the mapping
        // this call already holds; its directory entry's lock is write-held here
        let self_reference = dependency.base() == guard.image().base();

        for (index, thunk) in thunks.iter().enumerate() {
            let resolved = if self_reference {
                resolve_export_from_image(ctx, guard.image(), thunk.symbol(), thunk.hint())
            } else {
                resolve_export(ctx, &dependency, thunk.symbol(), thunk.hint())
            };
            let va = resolved.map_err(|_| crate::Error::ImportResolution {
                module: descriptor.module_name.clone(),
                symbol: thunk.symbol().to_string(),
            })?;

            let slot = descriptor.iat_rva + index as u32 * slot_size;
            if pe64 {
                guard.write_u64(slot, va)?;
            } else {
                guard.write_u32(slot, va as u32)?;
            }
        }
    }

    Ok(())
}
