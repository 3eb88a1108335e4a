//! Helpers shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use docmesh_storage::{DocumentStore, MemoryDocumentStore, MemoryKeyValueStore, PutOptions};
use docmesh_sync::settings::{MemorySettingsSource, ReplicatorSettings};
use docmesh_sync::transport::memory::{MemoryHub, MemoryMesh};
use docmesh_sync::{Capabilities, Confirm, PeerHost, PeerSession};
use docmesh_types::{DocId, Document};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ROOM: &str = "notes";

/// Confirm service answering every selection with a fixed choice.
pub struct ScriptedConfirm {
    pub choice: Mutex<Option<String>>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedConfirm {
    pub fn answering(choice: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            choice: Mutex::new(choice.map(str::to_string)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(choice: Option<&str>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            choice: Mutex::new(choice.map(str::to_string)),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_choice(&self, choice: Option<&str>) {
        *self.choice.lock().unwrap() = choice.map(str::to_string);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Confirm for ScriptedConfirm {
    async fn ask_yes_no(&self, _message: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        false
    }

    async fn ask_select_string(&self, _message: &str, options: &[String]) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let choice = self.choice.lock().unwrap().clone()?;
        assert!(options.contains(&choice), "unexpected choice {choice}");
        Some(choice)
    }

    async fn ask_string(
        &self,
        _title: &str,
        _prompt: &str,
        _placeholder: &str,
        _is_secret: bool,
    ) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        None
    }
}

/// Settings for a device that accepts everyone without asking.
pub fn trusting_settings(name: &str) -> ReplicatorSettings {
    ReplicatorSettings {
        device_name: name.to_string(),
        room: ROOM.to_string(),
        passphrase: "correct horse".to_string(),
        allow_list: ".*".to_string(),
        headless: true,
        rpc_timeout_ms: 5_000,
        batch_size: 2,
        ..Default::default()
    }
}

pub fn capabilities(settings: ReplicatorSettings, confirm: Arc<dyn Confirm>) -> Capabilities {
    Capabilities::new(
        confirm,
        Arc::new(MemoryKeyValueStore::new()),
        Arc::new(MemorySettingsSource::new(settings)),
    )
}

/// A device on the in-memory mesh.
pub struct Node {
    pub session: Arc<PeerSession>,
    pub store: Arc<MemoryDocumentStore>,
    pub confirm: Arc<ScriptedConfirm>,
}

impl Node {
    pub fn host(&self) -> &Arc<PeerHost> {
        self.session.host()
    }
}

/// Routes `tracing` output to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn node(hub: &Arc<MemoryHub>, settings: ReplicatorSettings) -> Node {
    init_tracing();
    let confirm = ScriptedConfirm::answering(None);
    let store = Arc::new(MemoryDocumentStore::new(format!("{}-local", settings.device_name)));
    let mesh = Arc::new(MemoryMesh::new(Arc::clone(hub), settings.room.clone()));
    let host = PeerHost::new(
        mesh,
        settings.device_name.clone(),
        settings.platform.clone(),
        Some(settings.rpc_timeout()),
    );
    let local: Arc<dyn DocumentStore> = store.clone();
    let session = PeerSession::new(host, local, capabilities(settings, confirm.clone()));
    session.start().await.unwrap();
    Node {
        session,
        store,
        confirm,
    }
}

/// Waits until `host` knows `count` peers.
pub async fn wait_for_peers(host: &PeerHost, count: usize) {
    for _ in 0..500 {
        if host.known_peers().await.len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} known peers");
}

/// Waits until `store` holds `count` documents.
pub async fn wait_for_docs(store: &MemoryDocumentStore, count: usize) {
    for _ in 0..500 {
        if store.doc_ids().await.len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} documents");
}

pub async fn put_doc(store: &dyn DocumentStore, id: &str, title: &str) {
    store
        .put(Document::new(id).with_field("title", title), PutOptions::default())
        .await
        .unwrap();
}

pub fn doc_id(id: &str) -> DocId {
    DocId::new(id)
}
