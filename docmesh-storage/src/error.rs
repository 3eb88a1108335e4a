//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Document (or revision) not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write rejected because the supplied revision is not current.
    #[error("document update conflict: {0}")]
    Conflict(String),

    /// The replica could not be reached at all.
    #[error("replica unreachable: {0}")]
    Unreachable(String),

    /// The replica answered with an unexpected HTTP status.
    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },

    /// Credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The adapter does not implement this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A live change subscriber fell behind and missed entries.
    #[error("change feed lagged by {0} entries")]
    Lagged(u64),
}

impl StorageError {
    /// Whether the error means the replica was not reachable (as opposed to
    /// answering with a failure).
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}
