//! Local change batching for docmesh.
//!
//! Filesystem events arrive in bursts. [`FileEventQueue`] absorbs them with a
//! per-file debounce bounded by a maximum delay, keeps deletes from
//! overtaking earlier writes, caps concurrent processing, and snapshots its
//! state to a [`docmesh_storage::KeyValueStore`] after every change so a
//! crash loses nothing.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use docmesh_queue::{FileEventItem, FileEventQueue, FileProcessor, QueueConfig, QueueResult};
//! use docmesh_storage::MemoryKeyValueStore;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl FileProcessor for Printer {
//!     async fn process(&self, item: &FileEventItem) -> QueueResult<()> {
//!         println!("{:?} {}", item.event_type, item.file);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> QueueResult<()> {
//! let queue = FileEventQueue::new(
//!     QueueConfig::default(),
//!     Arc::new(Printer),
//!     Arc::new(MemoryKeyValueStore::new()),
//! );
//! queue.restore()?;
//! queue.enqueue(FileEventItem::changed("notes/today.md"))?;
//! queue.wait_for_idle().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod item;
mod queue;
pub mod snapshot;

pub use error::{QueueError, QueueResult};
pub use item::{FileEventItem, FileEventType, QueueEntry};
pub use queue::{FileEventQueue, FileProcessor, QueueConfig};
pub use snapshot::SNAPSHOT_KEY;
