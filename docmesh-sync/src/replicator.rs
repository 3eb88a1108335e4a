//! Checkpointed, revision-diff based replication between two stores.
//!
//! A run pulls the source's change feed in batches, asks the target which
//! of the reported revisions it lacks, fetches only those (with history)
//! and writes them as-is, so branches and conflicts survive the trip.
//!
//! Two `_local/` documents make the run resumable:
//! - the *mark* lives on the source and names an epoch for this pair;
//! - the *since* cursor lives on the target, keyed by pair and mark.
//!
//! The cursor only advances after a batch has been written, so an aborted
//! run resumes from the last completed batch. Rewinding replaces the mark,
//! which orphans the old cursor and forces a full re-diff.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use docmesh_storage::{
    BulkDocsOptions, BulkGetItem, BulkGetRequest, ChangesRequest, ChangesStyle, DocumentStore,
    GetOptions, PutOptions, RevsDiffRequest, StorageError,
};
use docmesh_types::{ChangeEntry, DocId, Document, Seq};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default number of changes pulled per batch.
pub const DEFAULT_BATCH_SIZE: usize = 250;

const MARK_FIELD: &str = "mark";
const SINCE_FIELD: &str = "since";

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for one replication run.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Start a new epoch: forget the cursor and re-diff everything.
    pub rewind: bool,
    pub batch_size: usize,
    pub cancel: Option<CancelSignal>,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            rewind: false,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel: None,
        }
    }
}

/// Cursor positions reported with each written batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressInfo {
    /// The batch's `last_seq`; the cursor after this batch.
    pub last_seq: Seq,
    /// Highest sequence among the batch's entries.
    pub max_seq_in_batch: Seq,
}

/// Receives the documents written by each batch, ordered by sequence.
#[async_trait]
pub trait ReplicationObserver: Send + Sync {
    async fn on_progress(&self, docs: &[Document], progress: &ProgressInfo) -> SyncResult<()>;
}

/// Observer that ignores progress.
pub struct NoopObserver;

#[async_trait]
impl ReplicationObserver for NoopObserver {
    async fn on_progress(&self, _docs: &[Document], _progress: &ProgressInfo) -> SyncResult<()> {
        Ok(())
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    /// Batches pulled from the source's feed.
    pub batches: usize,
    /// Documents written to the target.
    pub docs_written: usize,
    /// Cursor at the end of the run.
    pub last_seq: Seq,
    /// The run stopped early because it was cancelled.
    pub cancelled: bool,
}

/// One async lock per ordered (target, source) pair.
#[derive(Default)]
pub struct PairLocks {
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl PairLocks {
    fn lock_for(&self, target: &str, source: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry((target.to_string(), source.to_string()))
                .or_default(),
        )
    }
}

fn checkpoint_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Id of the mark document kept on the source.
pub fn mark_checkpoint_id(target: &str, source: &str) -> DocId {
    DocId::new(format!(
        "_local/docmesh-mark-{}",
        checkpoint_hash(&[target, source])
    ))
}

/// Id of the cursor document kept on the target.
pub fn since_checkpoint_id(target: &str, source: &str, mark: &str) -> DocId {
    DocId::new(format!(
        "_local/docmesh-since-{}",
        checkpoint_hash(&[target, source, mark])
    ))
}

/// Reads a checkpoint, treating "not found" as absent.
async fn read_checkpoint(store: &dyn DocumentStore, id: &DocId) -> SyncResult<Option<Document>> {
    match store.get(id, &GetOptions::default()).await {
        Ok(doc) => Ok(Some(doc)),
        Err(StorageError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes `field = value` into a checkpoint unless it already holds it.
async fn write_checkpoint(
    store: &dyn DocumentStore,
    existing: Option<Document>,
    id: &DocId,
    field: &str,
    value: &str,
) -> SyncResult<()> {
    let doc = match existing {
        Some(doc) if doc.field(field).and_then(Value::as_str) == Some(value) => return Ok(()),
        Some(doc) => doc.with_field(field, value),
        None => Document::new(id.clone()).with_field(field, value),
    };
    store.put(doc, PutOptions::default()).await?;
    Ok(())
}

/// Drives replication runs.
#[derive(Default)]
pub struct Replicator {
    locks: PairLocks,
}

impl Replicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies everything `target` lacks from `source`.
    ///
    /// Runs for the same (target, source) pair are serialised.
    pub async fn replicate(
        &self,
        target: &dyn DocumentStore,
        source: &dyn DocumentStore,
        observer: &dyn ReplicationObserver,
        options: &ReplicationOptions,
    ) -> SyncResult<ReplicationSummary> {
        let lock = self.locks.lock_for(target.name(), source.name());
        let _guard = lock.lock().await;

        let result = self.run(target, source, observer, options).await;
        match &result {
            Ok(summary) => info!(
                target = target.name(),
                source = source.name(),
                batches = summary.batches,
                docs = summary.docs_written,
                last_seq = %summary.last_seq,
                "replication finished"
            ),
            Err(e) => warn!(
                target = target.name(),
                source = source.name(),
                "replication failed: {e}"
            ),
        }
        result
    }

    async fn run(
        &self,
        target: &dyn DocumentStore,
        source: &dyn DocumentStore,
        observer: &dyn ReplicationObserver,
        options: &ReplicationOptions,
    ) -> SyncResult<ReplicationSummary> {
        target.info().await?;
        source.info().await?;

        let mark = self
            .ensure_mark(target.name(), source, options.rewind)
            .await?;

        let since_id = since_checkpoint_id(target.name(), source.name(), &mark);
        let mut since_doc = read_checkpoint(target, &since_id).await?;
        let mut since = since_doc
            .as_ref()
            .and_then(|d| d.field(SINCE_FIELD))
            .and_then(Value::as_str)
            .map(Seq::new)
            .unwrap_or_else(Seq::start);
        debug!(
            target = target.name(),
            source = source.name(),
            %mark,
            %since,
            "replication starting"
        );

        let batch_size = options.batch_size.max(1);
        let mut summary = ReplicationSummary {
            last_seq: since.clone(),
            ..Default::default()
        };

        loop {
            if options.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
                summary.cancelled = true;
                break;
            }

            let batch = source
                .changes(&ChangesRequest {
                    since: since.clone(),
                    style: ChangesStyle::AllDocs,
                    limit: Some(batch_size),
                })
                .await?;
            if batch.results.is_empty() {
                break;
            }
            summary.batches += 1;

            summary.docs_written += self
                .transfer_batch(target, source, observer, &batch.results, &batch.last_seq)
                .await?;

            since = batch.last_seq;
            write_checkpoint(target, since_doc.take(), &since_id, SINCE_FIELD, since.as_str())
                .await?;
            since_doc = read_checkpoint(target, &since_id).await?;
            summary.last_seq = since.clone();
        }

        Ok(summary)
    }

    /// Returns the pair's mark, creating or replacing it as needed.
    async fn ensure_mark(
        &self,
        target_name: &str,
        source: &dyn DocumentStore,
        rewind: bool,
    ) -> SyncResult<String> {
        let id = mark_checkpoint_id(target_name, source.name());
        let existing = read_checkpoint(source, &id).await?;
        let current = existing
            .as_ref()
            .and_then(|d| d.field(MARK_FIELD))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mark = match current {
            Some(mark) if !rewind => return Ok(mark),
            _ => Uuid::new_v4().to_string(),
        };
        if rewind {
            info!(source = source.name(), target = target_name, "rewinding replication");
        }
        write_checkpoint(source, existing, &id, MARK_FIELD, &mark).await?;
        Ok(mark)
    }

    /// Moves the revisions of one batch that the target lacks. Returns the
    /// number of documents written.
    async fn transfer_batch(
        &self,
        target: &dyn DocumentStore,
        source: &dyn DocumentStore,
        observer: &dyn ReplicationObserver,
        entries: &[ChangeEntry],
        last_seq: &Seq,
    ) -> SyncResult<usize> {
        let mut candidates: RevsDiffRequest = BTreeMap::new();
        let mut max_seq: HashMap<DocId, Seq> = HashMap::new();
        let mut max_seq_in_batch = Seq::start();
        for entry in entries {
            candidates
                .entry(entry.id.clone())
                .or_default()
                .extend(entry.revisions().cloned());
            let seq = max_seq.entry(entry.id.clone()).or_insert_with(Seq::start);
            if entry.seq > *seq {
                *seq = entry.seq.clone();
            }
            if entry.seq > max_seq_in_batch {
                max_seq_in_batch = entry.seq.clone();
            }
        }

        let diff = target.revs_diff(&candidates).await?;
        let wanted: Vec<BulkGetItem> = diff
            .iter()
            .flat_map(|(id, entry)| {
                entry.missing.iter().map(|rev| BulkGetItem {
                    id: id.clone(),
                    rev: Some(rev.clone()),
                })
            })
            .collect();
        if wanted.is_empty() {
            debug!(last_seq = %last_seq, "nothing missing in batch");
            return Ok(0);
        }

        let requested = wanted.len();
        let (fetched, errors) = source
            .bulk_get(&BulkGetRequest {
                docs: wanted,
                revs: true,
            })
            .await?
            .into_parts();
        // The cursor must not move past revisions the target still lacks.
        if let Some(first) = errors.first() {
            return Err(SyncError::Protocol(format!(
                "{} of {requested} missing revisions could not be fetched from {} ({} {}: {})",
                errors.len(),
                source.name(),
                first.id,
                first.rev.as_deref().unwrap_or("-"),
                first.error,
            )));
        }
        if fetched.is_empty() {
            return Err(SyncError::Protocol(format!(
                "{} returned none of {requested} missing revisions",
                source.name()
            )));
        }

        let submitted = fetched.len();
        let results = target.bulk_docs(fetched, BulkDocsOptions::as_is()).await?;
        let failed = results.iter().filter(|r| !r.ok && r.error.is_some()).count();
        if failed > 0 {
            return Err(SyncError::Protocol(format!(
                "{failed} of {submitted} documents were rejected by {}",
                target.name()
            )));
        }

        // Report what the target now holds for each touched id.
        let mut written: Vec<(Seq, Document)> = Vec::new();
        for id in diff.keys() {
            let options = GetOptions {
                conflicts: true,
                ..Default::default()
            };
            let doc = match target.get(id, &options).await {
                Ok(doc) => doc,
                // The winner is a tombstone.
                Err(StorageError::NotFound(_)) => Document::new(id.clone()).deleted(),
                Err(e) => return Err(e.into()),
            };
            let seq = max_seq.get(id).cloned().unwrap_or_else(Seq::start);
            written.push((seq, doc));
        }
        written.sort_by(|a, b| a.0.cmp(&b.0));
        let docs: Vec<Document> = written.into_iter().map(|(_, doc)| doc).collect();

        let progress = ProgressInfo {
            last_seq: last_seq.clone(),
            max_seq_in_batch,
        };
        if let Err(e) = observer.on_progress(&docs, &progress).await {
            warn!("replication progress observer failed: {e}");
        }

        Ok(submitted)
    }
}
