//! Core type definitions for docmesh.
//!
//! This crate defines the replica-agnostic types shared by the storage,
//! replication and queue crates:
//! - Document and peer identifiers
//! - Revisions and revision histories (the per-document revision tree)
//! - Change-feed entries and their opaque sequence cursors
//!
//! Document bodies are opaque JSON: the replication protocol never looks
//! inside them.

mod document;
mod ids;
mod revision;

pub use document::{ChangeEntry, ChangeRev, Document, LOCAL_PREFIX};
pub use ids::{DocId, PeerId};
pub use revision::{Revision, RevisionHistory, Seq};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid revision: {0}")]
    InvalidRevision(String),
}
