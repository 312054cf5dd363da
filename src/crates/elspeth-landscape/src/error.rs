//! Error types for audit recording and payload storage
//!
//! All errors implement `std::error::Error` via the `thiserror` crate.
//! Recorder failures are deliberately coarse: a failed audit write is fatal
//! for the enclosing operation, so callers match on [`AuditError`] variants
//! only to report, never to recover.

use thiserror::Error;

/// Result type for landscape operations
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors raised by the landscape recorder and its backends
#[derive(Error, Debug)]
pub enum AuditError {
    /// A referenced record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A write violated an audit invariant (duplicate terminal state,
    /// out-of-order batch transition, unknown foreign key)
    #[error("audit invariant violated: {0}")]
    InvariantViolation(String),

    /// A value could not be canonicalized for hashing
    #[error("invalid value for canonical JSON: {0}")]
    InvalidValue(String),

    /// Serialization of a record failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying storage backend failed
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error from a filesystem-backed store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the content-addressed payload store
#[derive(Error, Debug)]
pub enum PayloadError {
    /// No blob stored under the given hash
    #[error("payload not found: {0}")]
    NotFound(String),

    /// Stored bytes do not hash to their key
    #[error("payload integrity failure for {hash}: stored bytes hash to {actual}")]
    Integrity { hash: String, actual: String },

    /// The key is not a valid SHA-256 hex digest
    #[error("invalid payload hash: {0}")]
    InvalidHash(String),

    /// I/O error from the backing store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PayloadError> for AuditError {
    fn from(err: PayloadError) -> Self {
        AuditError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for AuditError {
    fn from(err: rusqlite::Error) -> Self {
        AuditError::Storage(err.to_string())
    }
}
