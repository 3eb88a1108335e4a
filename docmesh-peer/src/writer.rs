//! Applies queued file events to the local document store.

use async_trait::async_trait;
use docmesh_queue::{FileEventItem, FileEventType, FileProcessor, QueueError, QueueResult};
use docmesh_storage::{DocumentStore, GetOptions, PutOptions, StorageError};
use docmesh_types::{DocId, Document, Revision};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Document id for a file path.
pub fn file_doc_id(path: &str) -> DocId {
    DocId::new(format!("file:{path}"))
}

/// Writes one document per file.
pub struct DocumentWriter {
    store: Arc<dyn DocumentStore>,
}

impl DocumentWriter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn current_rev(&self, id: &DocId) -> QueueResult<Option<Revision>> {
        match self.store.get(id, &GetOptions::default()).await {
            Ok(doc) => Ok(doc.rev),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(QueueError::processing(id.as_str(), e)),
        }
    }

    async fn write(&self, doc: Document) -> QueueResult<()> {
        let id = doc.id.clone();
        self.store
            .put(doc, PutOptions::default())
            .await
            .map_err(|e| QueueError::processing(id.as_str(), e))?;
        Ok(())
    }

    async fn upsert(&self, item: &FileEventItem) -> QueueResult<()> {
        let id = file_doc_id(&item.file);
        let mut doc = Document::new(id.clone())
            .with_field("path", item.file.clone())
            .with_field("content", item.cache.clone().unwrap_or(Value::Null));
        if let Some(rev) = self.current_rev(&id).await? {
            doc = doc.with_rev(rev);
        }
        self.write(doc).await
    }

    async fn remove(&self, path: &str) -> QueueResult<()> {
        let id = file_doc_id(path);
        let Some(rev) = self.current_rev(&id).await? else {
            debug!(path, "Nothing to delete");
            return Ok(());
        };
        self.write(Document::new(id).with_rev(rev).deleted()).await
    }
}

#[async_trait]
impl FileProcessor for DocumentWriter {
    async fn process(&self, item: &FileEventItem) -> QueueResult<()> {
        match item.event_type {
            FileEventType::Create | FileEventType::Changed => {
                if let Some(old_path) = &item.old_path {
                    self.remove(old_path).await?;
                }
                self.upsert(item).await
            }
            FileEventType::Delete => self.remove(&item.file).await,
            FileEventType::Internal => {
                debug!(file = %item.file, "Internal file change");
                Ok(())
            }
        }
    }
}
