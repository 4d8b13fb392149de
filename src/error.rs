use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        $crate::Error::MalformedSignature {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::MalformedSignature {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Most failures produced by the layout engine are *permanent*: the first error raised against a
/// type poisons that type, and every later operation on it reports the same original failure
/// instead of re-attempting the work (see [`crate::metadata::typesystem::TypeDescriptor`]).
///
/// # Error Categories
///
/// ## Metadata Decoding
/// - [`Error::MalformedSignature`] - Raw signature bytes do not parse
/// - [`Error::TypeNotFound`] - A `(module, token)` pair has no descriptor
///
/// ## Layout & Dispatch
/// - [`Error::LayoutViolation`] - Field offsets/packing/size constraints broken
/// - [`Error::VTableInconsistency`] - Override or interface dispatch could not be resolved
/// - [`Error::UnresolvedDependency`] - A parent, interface, or field type failed to load
/// - [`Error::RecursiveDefinition`] - The type definition graph is unresolvably cyclic
///
/// ## Infrastructure
/// - [`Error::RecursionLimit`] - Maximum recursion depth exceeded during resolution
/// - [`Error::LockError`] - Thread synchronization failure
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Raw bytes for a field or method signature don't parse.
    ///
    /// Always permanent: the owning type is poisoned with this error and all
    /// future consumers observe the same failure. The source location of the
    /// detection is carried for debugging.
    #[error("Malformed signature - {file}:{line}: {message}")]
    MalformedSignature {
        /// Description of what was malformed
        message: String,
        /// The source file in which this error was raised
        file: &'static str,
        /// The source line in which this error was raised
        line: u32,
    },

    /// A parent, interface, or field type failed to load.
    ///
    /// Propagates as poisoning of the dependent type. The message chains the
    /// root cause so the original failure stays visible at every level.
    #[error("{0}")]
    UnresolvedDependency(String),

    /// Field offsets, packing size, or instance size constraints were violated.
    ///
    /// Raised for overlapping reference/non-reference fields under explicit
    /// layout, packing sizes outside the legal range, and value types with
    /// non-positive or oversized instance sizes.
    #[error("{0}")]
    LayoutViolation(String),

    /// The virtual dispatch table could not be built consistently.
    ///
    /// Raised when an interface method is left unimplemented on a concrete
    /// type, an override fails signature/accessibility/static-ness checks, or
    /// a final vtable slot is empty or abstract on a concrete type.
    #[error("{0}")]
    VTableInconsistency(String),

    /// A type's definition graph is cyclic in a way that cannot be resolved.
    ///
    /// Detected via the in-progress set threaded through initialization.
    #[error("Recursive type definition detected: {0}")]
    RecursiveDefinition(String),

    /// Failed to find a type descriptor for the given token.
    #[error("Failed to find type in registry - {0}")]
    TypeNotFound(Token),

    /// Recursion limit reached.
    ///
    /// To prevent stack overflow during recursive signature resolution, a
    /// maximum recursion depth is enforced. The associated value shows the
    /// limit that was reached.
    #[error("Reached the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically when a
    /// mutex has been poisoned by a panicking thread.
    #[error("Failed to lock target")]
    LockError,
}

impl Error {
    /// Build an [`Error::UnresolvedDependency`] that chains a root cause.
    ///
    /// Produces the canonical "X could not be loaded, due to: Y" message so
    /// the original failure remains visible through arbitrarily many layers
    /// of dependent types.
    pub fn dependency(dependent: &str, cause: &Error) -> Error {
        Error::UnresolvedDependency(format!("{dependent} could not be loaded, due to: {cause}"))
    }
}
