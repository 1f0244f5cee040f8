//! # peload Prelude
//!
//! This module provides a convenient prelude for the most commonly used types
//! and traits of the loader. Import it to get quick access to everything needed
//! to load, query and unload plugin images.

/// The main error type for all peload operations
pub use crate::Error;

/// The result type used throughout peload
pub use crate::Result;

/// Address types used across the API
pub use crate::{Rva, Va};

/// The loader engine and its module directory
pub use crate::loader::{LoadedModule, LoaderContext};

/// Plugin load sequence states
pub use crate::loader::plugin::LoadState;

/// Export lookup by name or ordinal
pub use crate::loader::exports::Symbol;

/// Image mapping and the scoped write windows
pub use crate::image::{ImageMapper, MappedImage, ProtectionGuard};

/// The host-process seam
pub use crate::host::{HostEnv, LifecycleReason, ProcessHost};

/// Parsed image headers and the bounds-checked view
pub use crate::pe::{DataDirectory, ImageHeaders, ImageView, SectionHeader};
