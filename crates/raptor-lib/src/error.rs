//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by index construction, persistence and querying.
#[derive(Error, Debug)]
pub enum RaptorError {
    /// A parameter failed validation before any work started.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A file on disk does not match its expected format.
    #[error("malformed {what}: {detail}")]
    Format {
        /// Kind of file that failed to parse.
        what: &'static str,
        /// Description of the mismatch.
        detail: String,
    },

    /// A persisted index is incompatible with this version or with the
    /// parameters of the current run.
    #[error("incompatible index: {0}")]
    VersionMismatch(String),

    /// An allocation request could not be satisfied.
    #[error("allocation of {0} bytes failed")]
    ResourceExhausted(usize),

    /// The run was cancelled; output written so far is valid.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias using [`RaptorError`].
pub type Result<T> = std::result::Result<T, RaptorError>;
