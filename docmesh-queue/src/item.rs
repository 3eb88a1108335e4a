//! File events and the records persisted in the queue snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileEventType {
    Create,
    Changed,
    Delete,
    /// Changes to internal files. Never debounced.
    Internal,
}

impl FileEventType {
    /// Whether events of this type wait out the debounce delay.
    #[must_use]
    pub fn is_batched(self) -> bool {
        matches!(self, Self::Create | Self::Changed)
    }
}

/// One observed file event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEventItem {
    #[serde(rename = "type")]
    pub event_type: FileEventType,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    /// Content captured at observation time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Value>,
    /// Wait-state key. Defaults to the file path.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub skip_batch_wait: bool,
}

impl FileEventItem {
    pub fn new(event_type: FileEventType, file: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            event_type,
            key: file.clone(),
            file,
            old_path: None,
            cache: None,
            skip_batch_wait: false,
        }
    }

    pub fn create(file: impl Into<String>) -> Self {
        Self::new(FileEventType::Create, file)
    }

    pub fn changed(file: impl Into<String>) -> Self {
        Self::new(FileEventType::Changed, file)
    }

    pub fn delete(file: impl Into<String>) -> Self {
        Self::new(FileEventType::Delete, file)
    }

    pub fn internal(file: impl Into<String>) -> Self {
        Self::new(FileEventType::Internal, file)
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    #[must_use]
    pub fn with_old_path(mut self, old_path: impl Into<String>) -> Self {
        self.old_path = Some(old_path.into());
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Value) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn skipping_batch_wait(mut self) -> Self {
        self.skip_batch_wait = true;
        self
    }

    /// Whether this item is dispatched without a debounce wait.
    #[must_use]
    pub fn bypasses_wait(&self) -> bool {
        self.skip_batch_wait || !self.event_type.is_batched()
    }
}

/// A slot in the dispatch buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEntry {
    Event(FileEventItem),
    /// Blocks the drain loop until earlier waits are resolved.
    Flush,
}
