//! Error types for hologram-distributed operations

use crate::kind::ElementKind;

/// Result type for hologram-distributed operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hologram-distributed operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// No communication backend is bound in this process
    #[error("communication backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Strict initialization requested but the backend could not be bootstrapped
    #[error("distributed initialization failed: {0}")]
    Initialization(String),

    /// Backend library present but its identity did not validate
    #[error("backend identity mismatch: expected {expected:?}, found {found:?}")]
    VersionMismatch { expected: String, found: String },

    /// Element kind has no datatype or operator mapping
    #[error("unsupported element kind: {0}")]
    UnsupportedType(ElementKind),

    /// A backend call reported non-success
    #[error("communication error in {operation}: backend returned code {code}")]
    Comm { operation: &'static str, code: i32 },

    /// Buffer element counts violate the operation's precondition
    #[error("shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Input and output buffers disagree on element kind
    #[error("element kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: ElementKind, actual: ElementKind },

    /// Peer rank outside the group
    #[error("invalid rank {rank} for group of size {size}")]
    InvalidRank { rank: usize, size: usize },

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The stream's worker is gone
    #[error("stream {0:?} is closed")]
    StreamClosed(String),
}

impl Error {
    /// Build a [`Error::Comm`] from a backend return code
    pub fn comm(operation: &'static str, code: i32) -> Self {
        Self::Comm { operation, code }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
