//! The document store adapter interface and its request/response types.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use docmesh_types::{ChangeEntry, DocId, Document, Revision, Seq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Summary information about a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub db_name: String,
    pub update_seq: Seq,
}

/// Which revisions a change-feed entry reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesStyle {
    /// Only the winning revision.
    #[default]
    MainOnly,
    /// Every leaf revision, including conflicts.
    AllDocs,
}

impl ChangesStyle {
    /// Query-string value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainOnly => "main_only",
            Self::AllDocs => "all_docs",
        }
    }
}

/// Parameters of a change-feed read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesRequest {
    pub since: Seq,
    #[serde(default)]
    pub style: ChangesStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// One page of a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeEntry>,
    pub last_seq: Seq,
}

/// Candidate revisions per document.
pub type RevsDiffRequest = BTreeMap<DocId, Vec<Revision>>;

/// Revisions of one document the replica does not have.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    pub missing: Vec<Revision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<Revision>,
}

/// Only documents with at least one missing revision are present.
pub type RevsDiffResponse = BTreeMap<DocId, RevsDiffEntry>;

/// Options for `bulk_docs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDocsOptions {
    /// `false` writes revisions as-is, keeping their history and conflicts.
    pub new_edits: bool,
}

impl Default for BulkDocsOptions {
    fn default() -> Self {
        Self { new_edits: true }
    }
}

impl BulkDocsOptions {
    /// As-is write mode used by replication.
    #[must_use]
    pub fn as_is() -> Self {
        Self { new_edits: false }
    }
}

/// Options for `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOptions {
    pub new_edits: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self { new_edits: true }
    }
}

/// Options for `get`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOptions {
    /// Specific revision; the winner when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    /// Attach `_revisions`.
    #[serde(default)]
    pub revs: bool,
    /// Attach `_conflicts`.
    #[serde(default)]
    pub conflicts: bool,
}

/// Outcome of a single document write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub id: DocId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WriteResult {
    /// A successful write.
    pub fn ok(id: DocId, rev: Revision) -> Self {
        Self {
            id,
            rev: Some(rev),
            ok: true,
            error: None,
            reason: None,
        }
    }

    /// A failed write.
    pub fn failed(id: DocId, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id,
            rev: None,
            ok: false,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }
}

/// A document/revision to fetch in `bulk_get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkGetItem {
    pub id: DocId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
}

/// Parameters of `bulk_get`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkGetRequest {
    pub docs: Vec<BulkGetItem>,
    /// Attach full revision history to each returned document.
    #[serde(default)]
    pub revs: bool,
}

/// Error for one requested revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkGetError {
    pub id: DocId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

/// Either a document or an error, per requested revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BulkGetDoc {
    Ok { ok: Document },
    Error { error: BulkGetError },
}

/// Results for one requested id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkGetResult {
    pub id: DocId,
    pub docs: Vec<BulkGetDoc>,
}

/// Response of `bulk_get`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkGetResponse {
    pub results: Vec<BulkGetResult>,
}

impl BulkGetResponse {
    /// All successfully fetched documents, in response order.
    pub fn into_documents(self) -> Vec<Document> {
        self.into_parts().0
    }

    /// Fetched documents and per-revision errors, each in response order.
    pub fn into_parts(self) -> (Vec<Document>, Vec<BulkGetError>) {
        let mut docs = Vec::new();
        let mut errors = Vec::new();
        for doc in self.results.into_iter().flat_map(|r| r.docs) {
            match doc {
                BulkGetDoc::Ok { ok } => docs.push(ok),
                BulkGetDoc::Error { error } => errors.push(error),
            }
        }
        (docs, errors)
    }
}

/// A live subscription to a replica's change feed, starting "now".
pub struct ChangeSubscription {
    rx: broadcast::Receiver<ChangeEntry>,
}

impl ChangeSubscription {
    /// Wraps a broadcast receiver.
    pub fn new(rx: broadcast::Receiver<ChangeEntry>) -> Self {
        Self { rx }
    }

    /// Waits for the next change. `Ok(None)` means the feed completed.
    pub async fn next(&mut self) -> StorageResult<Option<ChangeEntry>> {
        match self.rx.recv().await {
            Ok(entry) => Ok(Some(entry)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(StorageError::Lagged(n)),
        }
    }
}

/// Uniform interface over any replica.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stable name of this replica, used to scope checkpoints and locks.
    fn name(&self) -> &str;

    /// Returns the replica's name and current update sequence.
    async fn info(&self) -> StorageResult<DatabaseInfo>;

    /// Reads the change feed after `request.since`.
    async fn changes(&self, request: &ChangesRequest) -> StorageResult<ChangesResponse>;

    /// Reports which of the given revisions this replica lacks.
    async fn revs_diff(&self, revs: &RevsDiffRequest) -> StorageResult<RevsDiffResponse>;

    /// Writes many documents at once.
    async fn bulk_docs(
        &self,
        docs: Vec<Document>,
        options: BulkDocsOptions,
    ) -> StorageResult<Vec<WriteResult>>;

    /// Fetches specific revisions.
    async fn bulk_get(&self, request: &BulkGetRequest) -> StorageResult<BulkGetResponse>;

    /// Writes one document.
    async fn put(&self, doc: Document, options: PutOptions) -> StorageResult<WriteResult>;

    /// Reads one document.
    async fn get(&self, id: &DocId, options: &GetOptions) -> StorageResult<Document>;

    /// Subscribes to changes made from now on.
    fn watch_changes(&self) -> StorageResult<ChangeSubscription> {
        Err(StorageError::Unsupported(format!(
            "live changes on {}",
            self.name()
        )))
    }
}
