//! Persisted queue state.
//!
//! The snapshot is the ordered list of every entry the queue still owes the
//! processor: dispatched but unfinished events, events waiting out their
//! debounce delay, then the dispatch buffer (flush markers included).

use crate::error::QueueResult;
use crate::item::QueueEntry;
use docmesh_storage::{KeyValueStore, KeyValueStoreExt};

/// Key under which the snapshot is stored.
pub const SNAPSHOT_KEY: &str = "file-event-queue";

/// Loads the snapshot. A missing snapshot is empty.
pub fn load(kv: &dyn KeyValueStore) -> QueueResult<Vec<QueueEntry>> {
    Ok(kv
        .get_json::<Vec<QueueEntry>>(SNAPSHOT_KEY)?
        .unwrap_or_default())
}

pub fn save(kv: &dyn KeyValueStore, entries: &[QueueEntry]) -> QueueResult<()> {
    kv.set_json(SNAPSHOT_KEY, entries)?;
    Ok(())
}
