//! Error types for the sync layer.

use docmesh_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error (peer or mesh unreachable).
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (invalid message format, unknown method).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage error from a local or remote replica.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Peer not found.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The acceptance model denied the peer.
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    /// Peer configuration is incompatible with ours.
    #[error("incompatible peer configuration: {0}")]
    Incompatible(String),

    /// The remote handler failed.
    #[error("remote error ({kind}): {message}")]
    Remote { kind: String, message: String },

    /// A handler asked for no response to be sent at all.
    #[error("response prevented")]
    ResponsePrevented,

    /// Operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Settings could not be read or written.
    #[error("configuration error: {0}")]
    Config(String),

    /// A programming error, such as a duplicate wait for one key.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl SyncError {
    /// Whether retrying later may succeed (connectivity and timeouts).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::ChannelClosed | Self::PeerNotFound(_) => true,
            Self::Storage(e) => e.is_unreachable(),
            _ => false,
        }
    }

    /// Short machine-readable classification sent in RPC error frames.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) | Self::PeerNotFound(_) | Self::ChannelClosed => "unreachable",
            Self::Timeout => "timeout",
            Self::Auth(_) | Self::PolicyDenied { .. } => "unauthorized",
            Self::Incompatible(_) => "incompatible",
            Self::Storage(StorageError::NotFound(_)) => "not_found",
            Self::Storage(StorageError::Conflict(_)) => "conflict",
            Self::Storage(StorageError::Unauthorized(_)) => "unauthorized",
            Self::Storage(StorageError::Unreachable(_)) => "unreachable",
            Self::Remote { .. } => "remote",
            _ => "internal",
        }
    }
}
