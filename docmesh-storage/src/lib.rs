//! Document store adapters for docmesh.
//!
//! Every replica, local or remote, is reached through the same
//! [`DocumentStore`] interface: `info`, `changes`, `revs_diff`, `bulk_docs`,
//! `bulk_get`, `put` and `get`. Replication only ever talks to this trait.
//!
//! # Adapters
//!
//! - [`MemoryDocumentStore`]: an in-process store with full revision-tree
//!   semantics (branches, tombstones, as-is writes, live change feed)
//! - [`HttpDocumentStore`]: a CouchDB-compatible document server over HTTP
//!
//! The crate also provides the small key-value store ([`KeyValueStore`])
//! used for acceptance decisions and the file-event queue snapshot.

mod error;
mod http;
mod kv;
mod memory;
mod rev_tree;
mod store;

pub use error::{StorageError, StorageResult};
pub use http::{HttpDocumentStore, HttpStoreConfig};
pub use kv::{KeyValueStore, KeyValueStoreExt, MemoryKeyValueStore, SqliteKeyValueStore};
pub use memory::MemoryDocumentStore;
pub use store::{
    BulkDocsOptions, BulkGetDoc, BulkGetError, BulkGetItem, BulkGetRequest, BulkGetResponse,
    BulkGetResult, ChangeSubscription, ChangesRequest, ChangesResponse, ChangesStyle,
    DatabaseInfo, DocumentStore, GetOptions, PutOptions, RevsDiffEntry, RevsDiffRequest,
    RevsDiffResponse, WriteResult,
};
