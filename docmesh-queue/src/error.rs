use docmesh_storage::StorageError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The snapshot could not be read or written.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] StorageError),

    /// The processor failed on an item.
    #[error("processing {file} failed: {message}")]
    Processing { file: String, message: String },

    /// The queue no longer accepts events.
    #[error("queue is shut down")]
    ShutDown,

    /// A programming error, such as two waits for one key.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl QueueError {
    pub fn processing(file: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Processing {
            file: file.into(),
            message: message.to_string(),
        }
    }
}
