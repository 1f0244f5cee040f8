//! Export resolution: by name, by ordinal, hint fast path and forwarder chains.
//!
//! The resolver works on the three parallel export tables (functions, names,
//! name-ordinals). The name table is sorted by the linker, so by-name lookup is
//! a byte-wise binary search, short-circuited by the linker-recorded hint when
//! the import binder supplies one. A resolved RVA that falls inside the export
//! directory's own byte range is a forwarder string (`"Dll.Function"` or
//! `"Dll.#Ordinal"`); chains are followed with a visited trail and fail with
//! [`crate::Error::CyclicForwarder`] instead of recursing unboundedly.

use std::fmt;

use log::debug;

use crate::{
    image::MappedImage,
    loader::{LoadedModule, LoaderContext, MAX_FORWARD_DEPTH},
    pe::{constants::{DIRECTORY_ENTRY_EXPORT, EXPORT_DIRECTORY_SIZE}, view::ImageView},
    Result, Rva, Va,
};

/// An export to resolve, by name or by ordinal.
#[derive(Debug, Clone, Copy)]
pub enum Symbol<'a> {
    /// Resolve by exported name.
    Name(&'a str),
    /// Resolve by export ordinal.
    Ordinal(u16),
}

impl fmt::Display for Symbol<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Name(name) => f.write_str(name),
            Symbol::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// Validated view of a module's export directory.
///
/// All three table extents are range-checked against the image before any
/// indexed access; arithmetic runs in `u64` so oversized counts cannot wrap.
pub(crate) struct ExportTables {
    directory_rva: Rva,
    directory_size: u32,
    ordinal_base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    functions_rva: Rva,
    names_rva: Rva,
    ordinals_rva: Rva,
}

impl ExportTables {
    /// Parses the export directory, if the image has one.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ImageFormat`] if a table extent lies outside the
    /// image.
    pub(crate) fn parse(image: &MappedImage) -> Result<Option<ExportTables>> {
        let Some(directory) = image.headers().directory(DIRECTORY_ENTRY_EXPORT) else {
            return Ok(None);
        };
        if (directory.size as usize) < EXPORT_DIRECTORY_SIZE {
            return Err(image_error!(
                "export directory of {:#x} bytes is too small",
                directory.size
            ));
        }

        let view = image.view();
        let base = directory.virtual_address;
        let tables = ExportTables {
            directory_rva: base,
            directory_size: directory.size,
            ordinal_base: view.read_u32(base + 16)?,
            number_of_functions: view.read_u32(base + 20)?,
            number_of_names: view.read_u32(base + 24)?,
            functions_rva: view.read_u32(base + 28)?,
            names_rva: view.read_u32(base + 32)?,
            ordinals_rva: view.read_u32(base + 36)?,
        };

        tables.check_extent(view, tables.functions_rva, tables.number_of_functions, 4)?;
        tables.check_extent(view, tables.names_rva, tables.number_of_names, 4)?;
        tables.check_extent(view, tables.ordinals_rva, tables.number_of_names, 2)?;

        Ok(Some(tables))
    }

    fn check_extent(
        &self,
        view: ImageView<'_>,
        start: Rva,
        count: u32,
        element_size: u64,
    ) -> Result<()> {
        let end = u64::from(start) + u64::from(count) * element_size;
        if end > view.len() as u64 {
            return Err(image_error!(
                "export table [{:#x}, {:#x}) extends past the image",
                start,
                end
            ));
        }
        Ok(())
    }

    fn is_forwarder(&self, rva: Rva) -> bool {
        rva >= self.directory_rva
            && u64::from(rva) < u64::from(self.directory_rva) + u64::from(self.directory_size)
    }

    fn function_rva(&self, view: ImageView<'_>, index: u32) -> Result<Rva> {
        view.read_u32(self.functions_rva + index * 4)
    }

    fn name_rva(&self, view: ImageView<'_>, index: u32) -> Result<Rva> {
        view.read_u32(self.names_rva + index * 4)
    }

    fn name_ordinal(&self, view: ImageView<'_>, index: u32) -> Result<u16> {
        view.read_u16(self.ordinals_rva + index * 2)
    }
}

fn not_found(symbol: Symbol<'_>) -> crate::Error {
    crate::Error::NotFound(symbol.to_string())
}

/// Outcome of one image's table walk, before forwarders are chased.
pub(crate) enum ImageResolution {
    /// A real address inside the image, with the image's guard flags.
    Address {
        /// The resolved virtual address.
        va: Va,
        /// `GuardFlags` of the exporting image, for the suppressed-call check.
        guard_flags: u32,
    },
    /// The address slot held a forwarder string.
    Forward(String),
}

/// Walks a single image's export tables without following forwarders.
///
/// Operates on an image the caller already holds, so it never touches the
/// module directory or any module lock.
pub(crate) fn resolve_in_image(
    image: &MappedImage,
    symbol: Symbol<'_>,
    hint: Option<u16>,
) -> Result<ImageResolution> {
    let view = image.view();
    let tables = ExportTables::parse(image)?.ok_or_else(|| not_found(symbol))?;

    let function_index = match symbol {
        Symbol::Ordinal(ordinal) => u32::from(ordinal)
            .checked_sub(tables.ordinal_base)
            .filter(|&index| index < tables.number_of_functions)
            .ok_or_else(|| not_found(symbol))?,
        Symbol::Name(name) => lookup_name(view, &tables, name, hint)?,
    };

    let rva = tables.function_rva(view, function_index)?;
    if rva == 0 {
        return Err(not_found(symbol));
    }

    if tables.is_forwarder(rva) {
        return Ok(ImageResolution::Forward(view.read_cstr(rva)?.to_string()));
    }

    Ok(ImageResolution::Address {
        va: image.rva_to_va(rva),
        guard_flags: image.headers().guard_flags,
    })
}

/// Resolves an export from `module` to a virtual address.
///
/// `hint` is the linker-recorded index into the name table; when it matches, the
/// binary search is skipped. Forwarder chains are followed transparently; a
/// suppressed-call grant is requested for non-forwarder results when the image
/// requires one.
///
/// # Errors
///
/// Returns [`crate::Error::NotFound`] if the symbol is absent,
/// [`crate::Error::ImageFormat`] for malformed export tables, and
/// [`crate::Error::CyclicForwarder`] if a forwarder chain loops or exceeds the
/// depth limit.
pub(crate) fn resolve_export(
    ctx: &LoaderContext,
    module: &LoadedModule,
    symbol: Symbol<'_>,
    hint: Option<u16>,
) -> Result<Va> {
    let mut trail = Vec::new();
    resolve_in_module(ctx, module, symbol, hint, &mut trail)
}

fn resolve_in_module(
    ctx: &LoaderContext,
    module: &LoadedModule,
    symbol: Symbol<'_>,
    hint: Option<u16>,
    trail: &mut Vec<String>,
) -> Result<Va> {
    // the read guard is released before any grant or dependency load happens
    let outcome = resolve_in_image(&module.image(), symbol, hint)?;

    match outcome {
        ImageResolution::Address { va, guard_flags } => {
            ctx.maybe_grant(guard_flags, va)?;
            Ok(va)
        }
        ImageResolution::Forward(forward) => resolve_forwarder(ctx, &forward, trail),
    }
}

/// Resolves an export from an image the caller already holds.
///
/// Used when the exporting module's lock is held by the caller and taking it
/// again through the directory entry would self-deadlock; forwarders still go
/// through the directory.
pub(crate) fn resolve_export_from_image(
    ctx: &LoaderContext,
    image: &MappedImage,
    symbol: Symbol<'_>,
    hint: Option<u16>,
) -> Result<Va> {
    match resolve_in_image(image, symbol, hint)? {
        ImageResolution::Address { va, guard_flags } => {
            ctx.maybe_grant(guard_flags, va)?;
            Ok(va)
        }
        ImageResolution::Forward(forward) => {
            let mut trail = Vec::new();
            resolve_forwarder(ctx, &forward, &mut trail)
        }
    }
}

/// Looks a name up in the sorted name table, returning the function index.
fn lookup_name(
    view: ImageView<'_>,
    tables: &ExportTables,
    name: &str,
    hint: Option<u16>,
) -> Result<u32> {
    let name_index = match hint {
        Some(hint) if u32::from(hint) < tables.number_of_names
            && view.read_cstr(tables.name_rva(view, u32::from(hint))?)? == name =>
        {
            u32::from(hint)
        }
        _ => search_name(view, tables, name)?,
    };

    let function_index = u32::from(tables.name_ordinal(view, name_index)?);
    if function_index >= tables.number_of_functions {
        return Err(image_error!(
            "name-ordinal {} exceeds the function table",
            function_index
        ));
    }

    Ok(function_index)
}

fn search_name(view: ImageView<'_>, tables: &ExportTables, name: &str) -> Result<u32> {
    let mut low = 0u32;
    let mut high = tables.number_of_names;

    while low < high {
        let mid = low + (high - low) / 2;
        let candidate = view.read_cstr(tables.name_rva(view, mid)?)?;

        match candidate.cmp(name) {
            std::cmp::Ordering::Equal => return Ok(mid),
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid,
        }
    }

    Err(crate::Error::NotFound(name.to_string()))
}

fn resolve_forwarder(
    ctx: &LoaderContext,
    forward: &str,
    trail: &mut Vec<String>,
) -> Result<Va> {
    let key = forward.to_ascii_lowercase();
    if trail.contains(&key) || trail.len() >= MAX_FORWARD_DEPTH {
        trail.push(key);
        return Err(crate::Error::CyclicForwarder(trail.join(" -> ")));
    }
    trail.push(key);

    let (module_name, target) = forward
        .split_once('.')
        .ok_or_else(|| image_error!("malformed forwarder string {:?}", forward))?;

    debug!("following forwarder {} -> {}", module_name, target);
    let dependency = ctx.load_dependency(module_name)?;

    if let Some(ordinal_text) = target.strip_prefix('#') {
        let ordinal: u16 = ordinal_text
            .parse()
            .map_err(|_| image_error!("malformed forwarder ordinal {:?}", forward))?;
        resolve_in_module(ctx, &dependency, Symbol::Ordinal(ordinal), None, trail)
    } else {
        resolve_in_module(ctx, &dependency, Symbol::Name(target), None, trail)
    }
}

/// Looks up the exported name carrying the given ordinal, if any.
///
/// Reverse walk of the name-ordinal table; used to enrich import-failure
/// diagnostics for by-ordinal imports.
#[must_use]
pub fn export_name_from_ordinal(image: &MappedImage, ordinal: u16) -> Option<String> {
    let tables = ExportTables::parse(image).ok()??;
    let view = image.view();

    for index in 0..tables.number_of_names {
        let function_index = tables.name_ordinal(view, index).ok()?;
        if u32::from(function_index) + tables.ordinal_base == u32::from(ordinal) {
            let name_rva = tables.name_rva(view, index).ok()?;
            return view.read_cstr(name_rva).ok().map(str::to_string);
        }
    }

    None
}
