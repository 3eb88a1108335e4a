//! A document store exposed over RPC, and its client-side counterpart.

use crate::error::{SyncError, SyncResult};
use crate::protocol::methods;
use crate::rpc::{RpcClient, RpcHandler, RpcServer};
use async_trait::async_trait;
use docmesh_storage::{
    BulkDocsOptions, BulkGetRequest, BulkGetResponse, ChangesRequest, ChangesResponse,
    DatabaseInfo, DocumentStore, GetOptions, PutOptions, RevsDiffRequest, RevsDiffResponse,
    StorageError, StorageResult, WriteResult,
};
use docmesh_types::{DocId, Document, PeerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

const HOSTED_METHODS: [&str; 7] = [
    methods::DB_INFO,
    methods::DB_CHANGES,
    methods::DB_REVS_DIFF,
    methods::DB_BULK_DOCS,
    methods::DB_BULK_GET,
    methods::DB_PUT,
    methods::DB_GET,
];

#[derive(Debug, Serialize, Deserialize)]
struct BulkDocsArgs {
    docs: Vec<Document>,
    options: BulkDocsOptions,
}

#[derive(Debug, Serialize, Deserialize)]
struct PutArgs {
    doc: Document,
    options: PutOptions,
}

#[derive(Debug, Serialize, Deserialize)]
struct GetArgs {
    id: DocId,
    #[serde(default)]
    options: GetOptions,
}

type Slot = Arc<RwLock<Option<Arc<dyn DocumentStore>>>>;

/// Serves a local store's operations to accepted peers.
pub struct HostedStore {
    server: Arc<RpcServer>,
    slot: Slot,
}

impl HostedStore {
    /// Registers the `db.*` methods on `server`, backed by `store`.
    pub fn host(server: Arc<RpcServer>, store: Arc<dyn DocumentStore>) -> Self {
        info!(store = store.name(), "hosting document store");
        let slot: Slot = Arc::new(RwLock::new(Some(store)));
        for method in HOSTED_METHODS {
            server.register(
                method,
                Arc::new(StoreHandler {
                    method,
                    slot: Arc::clone(&slot),
                }),
            );
        }
        Self { server, slot }
    }

    /// Whether a store is still attached.
    pub fn is_hosting(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Detaches the store and unregisters its methods. The store itself is
    /// left untouched.
    pub fn stop_hosting(&self) {
        let detached = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for method in HOSTED_METHODS {
            self.server.unregister(method);
        }
        if let Some(store) = detached {
            info!(store = store.name(), "stopped hosting document store");
        }
    }
}

struct StoreHandler {
    method: &'static str,
    slot: Slot,
}

fn parse<T: DeserializeOwned>(args: Value) -> SyncResult<T> {
    serde_json::from_value(args).map_err(|e| SyncError::Protocol(format!("invalid arguments: {e}")))
}

#[async_trait]
impl RpcHandler for StoreHandler {
    async fn handle(&self, _peer: &PeerId, args: Value) -> SyncResult<Value> {
        let store = self
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| SyncError::Storage(StorageError::Unreachable("store not hosted".into())))?;

        let value = match self.method {
            methods::DB_INFO => serde_json::to_value(store.info().await?)?,
            methods::DB_CHANGES => {
                let request: ChangesRequest = parse(args)?;
                serde_json::to_value(store.changes(&request).await?)?
            }
            methods::DB_REVS_DIFF => {
                let request: RevsDiffRequest = parse(args)?;
                serde_json::to_value(store.revs_diff(&request).await?)?
            }
            methods::DB_BULK_DOCS => {
                let BulkDocsArgs { docs, options } = parse(args)?;
                serde_json::to_value(store.bulk_docs(docs, options).await?)?
            }
            methods::DB_BULK_GET => {
                let request: BulkGetRequest = parse(args)?;
                serde_json::to_value(store.bulk_get(&request).await?)?
            }
            methods::DB_PUT => {
                let PutArgs { doc, options } = parse(args)?;
                serde_json::to_value(store.put(doc, options).await?)?
            }
            methods::DB_GET => {
                let GetArgs { id, options } = parse(args)?;
                serde_json::to_value(store.get(&id, &options).await?)?
            }
            other => return Err(SyncError::Protocol(format!("not a store method: {other}"))),
        };
        Ok(value)
    }
}

/// A peer's hosted store, reached over RPC.
pub struct RemoteDocumentStore {
    name: String,
    client: Arc<RpcClient>,
}

impl RemoteDocumentStore {
    /// `name` identifies the replica for checkpoints and pair locks, so it
    /// must be stable across reconnects (the peer's advertised name).
    pub fn new(name: impl Into<String>, client: Arc<RpcClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    async fn call<A, R>(&self, method: &str, args: &A) -> StorageResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.client
            .call_typed(method, args, None)
            .await
            .map_err(into_storage_error)
    }
}

/// Maps a failed RPC back into the store error the remote side raised.
fn into_storage_error(err: SyncError) -> StorageError {
    match err {
        SyncError::Remote { kind, message } => match kind.as_str() {
            "not_found" => StorageError::NotFound(message),
            "conflict" => StorageError::Conflict(message),
            "unauthorized" => StorageError::Unauthorized(message),
            "unreachable" | "timeout" => StorageError::Unreachable(message),
            _ => StorageError::Http {
                status: 500,
                message: format!("{kind}: {message}"),
            },
        },
        SyncError::Storage(e) => e,
        SyncError::Serialization(e) => StorageError::Serialization(e),
        e @ (SyncError::Network(_)
        | SyncError::Timeout
        | SyncError::ChannelClosed
        | SyncError::PeerNotFound(_)) => StorageError::Unreachable(e.to_string()),
        other => StorageError::InvalidData(other.to_string()),
    }
}

#[async_trait]
impl DocumentStore for RemoteDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> StorageResult<DatabaseInfo> {
        self.call(methods::DB_INFO, &Value::Null).await
    }

    async fn changes(&self, request: &ChangesRequest) -> StorageResult<ChangesResponse> {
        self.call(methods::DB_CHANGES, request).await
    }

    async fn revs_diff(&self, revs: &RevsDiffRequest) -> StorageResult<RevsDiffResponse> {
        self.call(methods::DB_REVS_DIFF, revs).await
    }

    async fn bulk_docs(
        &self,
        docs: Vec<Document>,
        options: BulkDocsOptions,
    ) -> StorageResult<Vec<WriteResult>> {
        self.call(methods::DB_BULK_DOCS, &BulkDocsArgs { docs, options })
            .await
    }

    async fn bulk_get(&self, request: &BulkGetRequest) -> StorageResult<BulkGetResponse> {
        self.call(methods::DB_BULK_GET, request).await
    }

    async fn put(&self, doc: Document, options: PutOptions) -> StorageResult<WriteResult> {
        self.call(methods::DB_PUT, &PutArgs { doc, options }).await
    }

    async fn get(&self, id: &DocId, options: &GetOptions) -> StorageResult<Document> {
        self.call(
            methods::DB_GET,
            &GetArgs {
                id: id.clone(),
                options: options.clone(),
            },
        )
        .await
    }
}
