//! Headless docmesh peer and its HTTP API.

mod writer;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use docmesh_queue::{FileEventItem, FileEventQueue, QueueConfig, QueueError};
use docmesh_storage::{DocumentStore, KeyValueStore};
use docmesh_sync::{
    Capabilities, HeadlessConfirm, MemorySettingsSource, MeshTransport, PeerHost, PeerSession,
    ReplicatorSettings,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use writer::{DocumentWriter, file_doc_id};

/// A running peer: the replication session plus the local file-event queue.
#[derive(Clone)]
pub struct PeerNode {
    pub session: Arc<PeerSession>,
    pub queue: Arc<FileEventQueue>,
    pub store: Arc<dyn DocumentStore>,
}

/// Queue timing taken from the replicator settings.
pub fn queue_config(settings: &ReplicatorSettings) -> QueueConfig {
    QueueConfig::from_millis(
        settings.queue_min_delay_ms,
        settings.queue_max_delay_ms,
        settings.queue_concurrency,
    )
}

/// Wires a session and a queue around `store`. Nothing is started.
///
/// The peer never prompts: unknown peers fall through to the allow and deny
/// lists and are otherwise refused.
pub fn assemble(
    mut settings: ReplicatorSettings,
    transport: Arc<dyn MeshTransport>,
    store: Arc<dyn DocumentStore>,
    kv: Arc<dyn KeyValueStore>,
) -> PeerNode {
    settings.headless = true;
    let host = PeerHost::new(
        transport,
        settings.device_name.clone(),
        settings.platform.clone(),
        Some(settings.rpc_timeout()),
    );
    let queue = FileEventQueue::new(
        queue_config(&settings),
        Arc::new(DocumentWriter::new(Arc::clone(&store))),
        Arc::clone(&kv),
    );
    let caps = Capabilities::new(
        Arc::new(HeadlessConfirm),
        kv,
        Arc::new(MemorySettingsSource::new(settings)),
    );
    let session = PeerSession::new(host, Arc::clone(&store), caps);

    PeerNode {
        session,
        queue: Arc::new(queue),
        store,
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PeerStatus {
    pub peer_id: String,
    pub name: String,
    pub platform: String,
    pub replicating_from: bool,
    pub replicating_to: bool,
    pub watching: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueStatus {
    pub waiting: usize,
    pub processing: usize,
    pub idle: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub peer_id: String,
    pub name: String,
    pub broadcasting: bool,
    pub last_broadcast_seq: Option<String>,
    pub peers: Vec<PeerStatus>,
    pub queue: QueueStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PeerSyncResult {
    pub peer_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncResponse {
    /// False when a sync of all peers was already running.
    pub started: bool,
    pub results: Vec<PeerSyncResult>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

async fn status_handler(State(node): State<PeerNode>) -> Json<StatusResponse> {
    let session = &node.session;
    let host = session.host();
    let peers = host
        .known_peers()
        .await
        .into_iter()
        .map(|peer| PeerStatus {
            replicating_from: session.is_replicating_from(&peer.peer_id),
            replicating_to: session.is_replicating_to(&peer.peer_id),
            watching: session.is_watching(&peer.peer_id),
            peer_id: peer.peer_id.to_string(),
            name: peer.name,
            platform: peer.platform,
        })
        .collect();

    Json(StatusResponse {
        peer_id: host.local_peer_id().to_string(),
        name: host.name().to_string(),
        broadcasting: session.is_broadcasting(),
        last_broadcast_seq: session.last_broadcast_seq().map(|seq| seq.to_string()),
        peers,
        queue: QueueStatus {
            waiting: node.queue.waiting_count(),
            processing: node.queue.processing_count(),
            idle: node.queue.is_idle(),
        },
    })
}

async fn events_handler(
    State(node): State<PeerNode>,
    Json(item): Json<FileEventItem>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let mut item = item;
    if item.key.is_empty() {
        item.key = item.file.clone();
    }
    node.queue.enqueue(item).map(|()| StatusCode::ACCEPTED).map_err(|e| {
        let status = match e {
            QueueError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: e.to_string() }))
    })
}

async fn sync_handler(State(node): State<PeerNode>) -> Json<SyncResponse> {
    let Some(results) = node.session.sync_all_peers().await else {
        return Json(SyncResponse {
            started: false,
            results: Vec::new(),
        });
    };

    Json(SyncResponse {
        started: true,
        results: results
            .into_iter()
            .map(|(peer_id, result)| PeerSyncResult {
                peer_id: peer_id.to_string(),
                ok: matches!(result, Ok(true)),
                error: result.err().map(|e| e.to_string()),
            })
            .collect(),
    })
}

/// Build the HTTP API router for a peer.
pub fn build_router(node: PeerNode) -> Router {
    Router::new()
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/events", post(events_handler))
        .route("/api/v1/sync", post(sync_handler))
        .with_state(node)
}
