use thiserror::Error;

macro_rules! image_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::ImageFormat {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::ImageFormat {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants follow the failure taxonomy of the load sequence: image validation, symbol
/// resolution, relocation, protection discipline, and entry-point dispatch. The orchestrator
/// in [`crate::loader`] is the single place that converts any of these into a full rollback;
/// no partially-bound or partially-relocated module is ever left reachable.
///
/// # Examples
///
/// ```rust,no_run
/// use peload::{Error, ImageMapper};
/// use std::path::Path;
///
/// match ImageMapper::host().map_file(Path::new("plugin.dll")) {
///     Ok(image) => println!("mapped at {:#x}", image.base()),
///     Err(Error::MachineMismatch { expected, found }) => {
///         eprintln!("wrong architecture: {found:#06x} (host is {expected:#06x})");
///     }
///     Err(Error::ImageFormat { message, file, line }) => {
///         eprintln!("malformed image: {message} ({file}:{line})");
///     }
///     Err(e) => eprintln!("load failed: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The image is damaged or violates the PE/COFF layout rules.
    ///
    /// Covers bad signatures, out-of-bounds directory or table extents, overflowing
    /// table arithmetic, and any other structural violation detected while walking
    /// image data. The source location where the violation was detected is recorded
    /// for debugging.
    #[error("malformed image - {file}:{line}: {message}")]
    ImageFormat {
        /// Description of the structural violation
        message: String,
        /// The source file in which this error was raised
        file: &'static str,
        /// The source line in which this error was raised
        line: u32,
    },

    /// An out of bound access was attempted while reading image data.
    ///
    /// Raised by the bounds-checked image view before any read beyond the mapped
    /// region can occur.
    #[error("out of bound read would have occurred")]
    OutOfBounds,

    /// The image was built for a machine type other than the host's.
    #[error("image machine type {found:#06x} does not match the host machine type {expected:#06x}")]
    MachineMismatch {
        /// The machine type the host requires
        expected: u16,
        /// The machine type found in the image file header
        found: u16,
    },

    /// The image subsystem is not one the plugin loader accepts.
    #[error("image subsystem {0} is not a loadable subsystem")]
    SubsystemMismatch(u16),

    /// The image is neither a DLL nor an executable image.
    #[error("image is not an executable or DLL image")]
    NotExecutable,

    /// The requested export does not exist in the module.
    #[error("export {0} not found")]
    NotFound(String),

    /// An import could not be resolved against its dependency module.
    ///
    /// Identifies the dependency module and the missing name or ordinal, suitable
    /// for a user-facing diagnostic.
    #[error("unable to resolve import {symbol} from {module}")]
    ImportResolution {
        /// The dependency module the import names
        module: String,
        /// The unresolved symbol, either a name or `#ordinal`
        symbol: String,
    },

    /// A dependency module could not be located or mapped.
    #[error("module {0} could not be loaded")]
    ModuleNotLoaded(String),

    /// The base-relocation directory contains a malformed block.
    #[error("malformed relocation block - {0}")]
    Relocation(String),

    /// An export forwarder chain loops back on itself.
    ///
    /// The original loader resolves forwarders with unguarded recursion; this
    /// implementation tracks the chain and fails instead. The payload is the
    /// full `module!symbol` chain for diagnostics.
    #[error("cyclic export forwarder chain: {0}")]
    CyclicForwarder(String),

    /// The module entry point reported failure when invoked.
    #[error("module entry point reported failure")]
    EntryPoint,

    /// The image declares no entry point.
    #[error("image has no entry point")]
    EntryPointNotFound,

    /// A write was attempted to image memory that is not currently writable.
    ///
    /// Writes to mapped images are only legal inside an active protection window;
    /// this error surfaces violations of that discipline.
    #[error("write to non-writable image memory at {va:#x}")]
    ProtectionViolation {
        /// The virtual address of the attempted write
        va: u64,
    },

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate while validating the on-disk PE file.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Provided input was empty.
    #[error("provided input was empty")]
    Empty,
}
