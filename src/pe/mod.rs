//! PE image structure parsing for the in-process loader.
//!
//! This module contains everything the loader needs to understand a mapped PE image:
//!
//! - [`crate::pe::constants`] - PE/COFF constants, characteristics and flag words
//! - [`crate::pe::headers`] - [`ImageHeaders`], a validated one-shot parse of the
//!   DOS/NT/optional headers, data directories and section table
//! - [`crate::pe::view`] - [`ImageView`], the bounds-checked byte view every
//!   directory and table reader goes through
//!
//! The readers here operate on *virtual-layout* bytes, the way a loader walks an
//! image at its base address. On-disk file validation (before the virtual layout
//! exists) is handled separately by [`crate::image::ImageMapper`] using goblin.
//!
//! # References
//!
//! - Microsoft PE/COFF Specification

pub mod constants;
pub mod headers;
pub mod view;

pub use headers::{DataDirectory, ImageHeaders, SectionHeader};
pub use view::ImageView;
