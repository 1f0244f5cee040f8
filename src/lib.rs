// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
//#![deny(unsafe_code)]
// - 'host.rs' transmutes an entry-point address into a function pointer
// - 'image/mapper.rs' uses mmap to read the input file

//! # peload
//!
//! An in-process PE (Portable Executable) image loader and dynamic-linking
//! engine for plugin modules. `peload` maps a module image into the current
//! process, applies base relocations when the image is not at its preferred
//! base, binds ordinary and delay-load imports against host modules (including
//! the host executable itself under its canonical import name, so a renamed
//! host binary still resolves), follows forwarded exports, grants
//! Control-Flow-Guard suppressed-call access where required, and drives the
//! module's lifecycle entry point with full rollback on any failure.
//!
//! ## Features
//!
//! - **Complete load sequence** - map, relocate, bind imports and delay
//!   imports, attach; a failure at any step unwinds everything
//! - **Malformed-image defense** - every directory and table read is
//!   bounds-checked and overflow-checked against the mapping
//! - **Export resolution** - by name (sorted-table binary search with hint
//!   fast path), by ordinal, and across forwarder chains with cycle detection
//! - **Protection discipline** - image writes only happen inside scoped
//!   elevate/restore windows that restore on every exit path
//! - **Host seam** - the OS surface (file search order, entry dispatch, CFG)
//!   is a trait, so the engine is testable without a real plugin
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peload::prelude::*;
//!
//! let mapper = ImageMapper::host();
//! let host_image = mapper.map_file("host.exe".as_ref())?;
//! let loader = LoaderContext::new(Arc::new(ProcessHost::new()), mapper, host_image, "host.exe");
//!
//! let base = loader.load_plugin_image("plugin.dll".as_ref())?;
//! let entry = loader.procedure_address_at(base, Symbol::Name("PluginGetInfo"))?;
//! println!("plugin at {base:#x}, PluginGetInfo at {entry:#x}");
//!
//! loader.unload_plugin_image(base)?;
//! # Ok::<(), peload::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `peload` is organized into a few key modules:
//! - [`pe`] - PE constants, validated header parsing and the bounds-checked
//!   image view every reader goes through
//! - [`image`] - the virtual-layout mapping, its protection table and the
//!   scoped write windows, plus the file mapper
//! - [`host`] - the [`HostEnv`] seam and the production [`ProcessHost`]
//! - [`loader`] - the module directory, export resolver, relocation engine,
//!   import and delay-import binders, and the plugin load orchestrator

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use peload::prelude::*;
///
/// let mapper = ImageMapper::host();
/// let host_image = mapper.map_file("host.exe".as_ref())?;
/// let loader = LoaderContext::new(Arc::new(ProcessHost::new()), mapper, host_image, "host.exe");
/// # Ok::<(), peload::Error>(())
/// ```
pub mod prelude;

/// PE/COFF structures: constants, validated headers and the bounds-checked view.
pub mod pe;

/// Mapped images, the section-protection discipline and the file mapper.
pub mod image;

/// The host-process seam: module search, entry dispatch and guard services.
pub mod host;

/// The loader engine: module directory, resolvers, binders and orchestrator.
pub mod loader;

/// A virtual address in the current process.
pub type Va = u64;

/// A relative virtual address, an offset from an image's base.
pub type Rva = u32;

pub use error::Error;

/// The result type used throughout peload.
pub type Result<T> = std::result::Result<T, Error>;

pub use host::{HostEnv, LifecycleReason, ProcessHost};
pub use image::{ImageMapper, MappedImage, ProtectionGuard};
pub use loader::{
    base_name_hash, exports::export_name_from_ordinal, exports::Symbol, plugin::LoadState,
    LoadedModule, LoaderContext,
};
