//! Error types for fabric operations.

use thiserror::Error;

/// Errors that can occur during fabric operations.
#[derive(Error, Debug)]
pub enum FabricError {
    /// Malformed attributes, missing callback, empty name, stale handle.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was malformed.
        reason: String,
    },

    /// Registry table or bounded array full.
    #[error("out of space in {what}")]
    OutOfSpace {
        /// Which bounded resource was exhausted.
        what: &'static str,
    },

    /// Shared memory or local allocation failure.
    #[error("out of memory creating {name}")]
    OutOfMemory {
        /// Resource name.
        name: String,
    },

    /// Name collision with incompatible attributes. Fatal, not retryable.
    #[error("already exists with incompatible attributes: {name}")]
    AlreadyExists {
        /// Colliding name.
        name: String,
    },

    /// Attach target absent.
    #[error("not found: {name}")]
    NotFound {
        /// Requested name.
        name: String,
    },

    /// Cross-process structural disagreement. Always fatal; signals a
    /// build/configuration inconsistency, never silently ignored.
    #[error("shared layout mismatch on {name}")]
    LayoutMismatch {
        /// Block whose recorded layout disagreed.
        name: String,
    },

    /// A registration callback explicitly aborted, or a bounded wait
    /// expired while honoring a stop request.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// What was cancelled.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {source}")]
    Io {
        /// Source IO error.
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error.
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error.
        #[from]
        source: nix::Error,
    },
}

/// Result type for fabric operations.
pub type FabricResult<T> = Result<T, FabricError>;
