//! Documents and change-feed entries.
//!
//! Documents use the field layout of CouchDB-compatible servers so that the
//! same JSON travels unchanged between the local store, the HTTP store and
//! the peer RPC layer.

use crate::{DocId, Revision, RevisionHistory, Seq};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Id prefix of documents that are never replicated (checkpoints, markers).
pub const LOCAL_PREFIX: &str = "_local/";

fn is_false(b: &bool) -> bool {
    !*b
}

/// A document at one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocId,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    /// Tombstone marker. Deletion is a revision, not a removal.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    /// Ancestry of `rev`, present when requested (`revs=true`) or when
    /// writing as-is.
    #[serde(rename = "_revisions", default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionHistory>,

    /// Losing leaf revisions, present when requested.
    #[serde(rename = "_conflicts", default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Revision>,

    /// Everything else: the opaque document content.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Document {
    /// Creates a new document with no revision yet.
    pub fn new(id: impl Into<DocId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Sets a body field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Sets the revision.
    pub fn with_rev(mut self, rev: Revision) -> Self {
        self.rev = Some(rev);
        self
    }

    /// Marks the document as a tombstone.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Reads a body field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Whether this is a local (never replicated) document.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.id.is_local()
    }

    /// Full revision chain of this document, newest first. Falls back to
    /// just `rev` when no history is attached.
    #[must_use]
    pub fn revision_chain(&self) -> Vec<Revision> {
        match (&self.revisions, &self.rev) {
            (Some(history), _) => history.revisions(),
            (None, Some(rev)) => vec![rev.clone()],
            (None, None) => Vec::new(),
        }
    }
}

/// One revision reported for a change-feed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: Revision,
}

/// One entry of a replica's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: DocId,
    pub seq: Seq,
    /// Leaf revisions (all of them with `style=all_docs`, otherwise the
    /// winner only).
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl ChangeEntry {
    /// Revisions mentioned by this entry.
    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.changes.iter().map(|c| &c.rev)
    }
}
