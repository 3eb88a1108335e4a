//! Replication sessions with mesh peers.
//!
//! [`PeerSession`] turns discovered peers into replication runs. Pulling
//! from a peer is always authenticate, compare tweaks, then replicate.
//! Pushing asks the peer to pull from us. At most one pull and one push per
//! peer run at a time; a second request for the same direction is skipped.
//!
//! With live broadcast enabled every local change is announced to accepted
//! peers via `notifyChanges`; peers that watch us answer by pulling.

use crate::acceptance::{AcceptanceModel, matches_list};
use crate::capabilities::Capabilities;
use crate::error::{SyncError, SyncResult};
use crate::host::{HostEvent, KnownPeer, PeerHost};
use crate::hosted::{HostedStore, RemoteDocumentStore};
use crate::protocol::methods;
use crate::replicator::{
    ProgressInfo, ReplicationObserver, ReplicationOptions, ReplicationSummary, Replicator,
};
use crate::rpc::{RpcGate, handler_fn};
use crate::tweaks::TweakValues;
use async_trait::async_trait;
use docmesh_storage::DocumentStore;
use docmesh_types::{Document, PeerId, Seq};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which way a replication runs, seen from this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Pulling the peer's changes into our store.
    From,
    /// Having the peer pull our changes.
    To,
}

/// UI-facing notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerDiscovered(KnownPeer),
    PeerLeft(PeerId),
    ReplicationStarted {
        peer: PeerId,
        direction: Direction,
    },
    ReplicationProgress {
        peer: PeerId,
        docs: usize,
        last_seq: Seq,
    },
    /// The peer reported progress while pulling from us.
    RemoteProgress {
        peer: PeerId,
        docs: usize,
        last_seq: Seq,
    },
    ReplicationFinished {
        peer: PeerId,
        direction: Direction,
        docs_written: usize,
    },
    ReplicationFailed {
        peer: PeerId,
        direction: Direction,
        message: String,
    },
    /// Tweak values differ. `fatal` means replication was refused.
    TweakMismatch {
        peer: PeerId,
        differences: Vec<String>,
        fatal: bool,
    },
    /// A peer announced new changes.
    ChangesAvailable {
        peer: PeerId,
        last_seq: Option<Seq>,
    },
    BroadcastStarted,
    BroadcastStopped,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthReply {
    accepted: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullReply {
    docs_written: usize,
    batches: usize,
    last_seq: Seq,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressArgs {
    #[serde(default)]
    docs: usize,
    #[serde(default)]
    last_seq: Seq,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesArgs {
    #[serde(default)]
    last_seq: Option<Seq>,
}

/// Membership in one of the replicating-with sets, released on drop.
struct ActiveGuard<'a> {
    set: &'a Mutex<HashSet<PeerId>>,
    peer: PeerId,
}

impl<'a> ActiveGuard<'a> {
    fn enter(set: &'a Mutex<HashSet<PeerId>>, peer: &PeerId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone());
        inserted.then(|| Self {
            set,
            peer: peer.clone(),
        })
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.peer);
    }
}

/// Clears the sync-all flag on drop.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Admits peers the acceptance model accepts, by advertised name.
struct AcceptanceGate {
    host: Weak<PeerHost>,
    acceptance: Arc<AcceptanceModel>,
}

#[async_trait]
impl RpcGate for AcceptanceGate {
    async fn admit(&self, peer: &PeerId) -> bool {
        let Some(host) = self.host.upgrade() else {
            return false;
        };
        match host.peer(peer).await {
            Some(known) => self.acceptance.is_accepted(peer, &known.name).await,
            None => false,
        }
    }
}

/// Emits progress locally and acknowledges it to the peer we pull from.
struct PullObserver {
    host: Arc<PeerHost>,
    events: broadcast::Sender<SessionEvent>,
    peer: PeerId,
}

#[async_trait]
impl ReplicationObserver for PullObserver {
    async fn on_progress(&self, docs: &[Document], progress: &ProgressInfo) -> SyncResult<()> {
        let _ = self.events.send(SessionEvent::ReplicationProgress {
            peer: self.peer.clone(),
            docs: docs.len(),
            last_seq: progress.last_seq.clone(),
        });

        let args = serde_json::to_value(ProgressArgs {
            docs: docs.len(),
            last_seq: progress.last_seq.clone(),
        })?;
        let host = Arc::clone(&self.host);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            if let Err(e) = host.call(&peer, methods::NOTIFY_PROGRESS, args, None).await {
                debug!(%peer, "progress acknowledgement failed: {e}");
            }
        });
        Ok(())
    }
}

/// Replication orchestration over a [`PeerHost`].
pub struct PeerSession {
    host: Arc<PeerHost>,
    local: Arc<dyn DocumentStore>,
    caps: Capabilities,
    acceptance: Arc<AcceptanceModel>,
    replicator: Replicator,
    hosted: HostedStore,
    events: broadcast::Sender<SessionEvent>,

    replicating_from: Mutex<HashSet<PeerId>>,
    replicating_to: Mutex<HashSet<PeerId>>,
    watched: Mutex<HashSet<PeerId>>,
    syncing_all: AtomicBool,

    broadcasting: Arc<AtomicBool>,
    last_broadcast_seq: Arc<Mutex<Option<Seq>>>,
    notify_locks: Arc<Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    broadcast_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    /// Wires the session into `host`: hosts `local`, installs the
    /// acceptance gate and registers the session methods.
    pub fn new(host: Arc<PeerHost>, local: Arc<dyn DocumentStore>, caps: Capabilities) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let acceptance = Arc::new(AcceptanceModel::new(caps.clone()));
        host.server().set_gate(Arc::new(AcceptanceGate {
            host: Arc::downgrade(&host),
            acceptance: Arc::clone(&acceptance),
        }));
        let hosted = HostedStore::host(Arc::clone(host.server()), Arc::clone(&local));

        let session = Arc::new(Self {
            host,
            local,
            caps,
            acceptance,
            replicator: Replicator::new(),
            hosted,
            events,
            replicating_from: Mutex::new(HashSet::new()),
            replicating_to: Mutex::new(HashSet::new()),
            watched: Mutex::new(HashSet::new()),
            syncing_all: AtomicBool::new(false),
            broadcasting: Arc::new(AtomicBool::new(false)),
            last_broadcast_seq: Arc::new(Mutex::new(None)),
            notify_locks: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
            broadcast_task: Mutex::new(None),
        });
        session.register_methods();
        session
    }

    fn register_methods(self: &Arc<Self>) {
        let server = self.host.server();

        let weak = Arc::downgrade(self);
        server.register(
            methods::REQUEST_AUTHENTICATION,
            handler_fn(move |peer, _args| {
                let weak = weak.clone();
                async move { upgrade(&weak)?.handle_authentication(&peer).await }
            }),
        );

        let weak = Arc::downgrade(self);
        server.register(
            methods::GET_TWEAK_VALUES,
            handler_fn(move |_peer, _args| {
                let weak = weak.clone();
                async move {
                    let session = upgrade(&weak)?;
                    let settings = session.caps.settings.current();
                    Ok(serde_json::to_value(TweakValues::from_settings(&settings))?)
                }
            }),
        );

        let weak = Arc::downgrade(self);
        server.register(
            methods::REQUEST_PULL,
            handler_fn(move |peer, _args| {
                let weak = weak.clone();
                async move {
                    let session = upgrade(&weak)?;
                    let summary = session.replicate_from(&peer).await?;
                    Ok(serde_json::to_value(PullReply {
                        docs_written: summary.docs_written,
                        batches: summary.batches,
                        last_seq: summary.last_seq,
                    })?)
                }
            }),
        );

        let weak = Arc::downgrade(self);
        server.register(
            methods::NOTIFY_PROGRESS,
            handler_fn(move |peer, args| {
                let weak = weak.clone();
                async move {
                    let session = upgrade(&weak)?;
                    let progress: ProgressArgs = serde_json::from_value(args).unwrap_or_default();
                    let _ = session.events.send(SessionEvent::RemoteProgress {
                        peer,
                        docs: progress.docs,
                        last_seq: progress.last_seq,
                    });
                    Ok(Value::Null)
                }
            }),
        );

        let weak = Arc::downgrade(self);
        server.register(
            methods::NOTIFY_CHANGES,
            handler_fn(move |peer, args| {
                let weak = weak.clone();
                async move {
                    let session = upgrade(&weak)?;
                    let changes: ChangesArgs = serde_json::from_value(args).unwrap_or_default();
                    session.on_changes_available(peer, changes.last_seq);
                    Ok(Value::Null)
                }
            }),
        );
    }

    /// Starts listening for peers, then joins the mesh.
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        let mut rx = self.host.subscribe();
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("session missed {n} host events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.on_host_event(event);
            }
        });
        self.push_task(task);

        self.host.start().await?;
        if self.caps.settings.current().auto_broadcast {
            self.start_broadcast()?;
        }
        Ok(())
    }

    /// Stops broadcasting and hosting, and leaves the mesh.
    pub async fn stop(&self) -> SyncResult<()> {
        self.stop_broadcast();
        self.hosted.stop_hosting();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.host.stop().await
    }

    fn push_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub fn host(&self) -> &Arc<PeerHost> {
        &self.host
    }

    pub fn acceptance(&self) -> &Arc<AcceptanceModel> {
        &self.acceptance
    }

    /// Subscribes to session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // ── Peer lifecycle ───────────────────────────────────────────

    fn on_host_event(self: &Arc<Self>, event: HostEvent) {
        match event {
            HostEvent::PeerDiscovered(peer) => {
                self.emit(SessionEvent::PeerDiscovered(peer.clone()));
                self.apply_auto_policies(&peer);
            }
            HostEvent::PeerLeft(peer) => {
                self.watched
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&peer);
                self.notify_locks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&peer);
                self.emit(SessionEvent::PeerLeft(peer));
            }
        }
    }

    fn apply_auto_policies(self: &Arc<Self>, peer: &KnownPeer) {
        let settings = self.caps.settings.current();
        if matches_list(&settings.auto_watch_list, &peer.name) {
            info!(peer = %peer.peer_id, name = %peer.name, "watching peer");
            self.watch(&peer.peer_id);
        }
        if matches_list(&settings.auto_sync_list, &peer.name) {
            info!(peer = %peer.peer_id, name = %peer.name, "auto-syncing with peer");
            let session = Arc::clone(self);
            let peer_id = peer.peer_id.clone();
            let task = tokio::spawn(async move {
                if session.replicate_from(&peer_id).await.is_ok() {
                    let _ = session.replicate_to(&peer_id).await;
                }
            });
            self.push_task(task);
        }
    }

    fn on_changes_available(self: &Arc<Self>, peer: PeerId, last_seq: Option<Seq>) {
        self.emit(SessionEvent::ChangesAvailable {
            peer: peer.clone(),
            last_seq,
        });
        if !self.is_watching(&peer) || self.is_replicating_from(&peer) {
            return;
        }
        debug!(%peer, "watched peer has changes, pulling");
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _ = session.replicate_from(&peer).await;
        });
        self.push_task(task);
    }

    /// Pull automatically whenever this peer announces changes.
    pub fn watch(&self, peer: &PeerId) {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone());
    }

    pub fn unwatch(&self, peer: &PeerId) {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    pub fn is_watching(&self, peer: &PeerId) -> bool {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer)
    }

    pub fn is_replicating_from(&self, peer: &PeerId) -> bool {
        self.replicating_from
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer)
    }

    pub fn is_replicating_to(&self, peer: &PeerId) -> bool {
        self.replicating_to
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer)
    }

    // ── Served methods ───────────────────────────────────────────

    async fn handle_authentication(&self, peer: &PeerId) -> SyncResult<Value> {
        let Some(known) = self.host.peer(peer).await else {
            // Never advertised itself: do not answer at all.
            debug!(%peer, "authentication request from unknown peer");
            return Err(SyncError::ResponsePrevented);
        };
        let accepted = self.acceptance.is_accepted(peer, &known.name).await;
        if !accepted {
            info!(%peer, name = %known.name, "authentication denied");
        }
        Ok(serde_json::to_value(AuthReply { accepted })?)
    }

    // ── Replication ──────────────────────────────────────────────

    async fn known_peer(&self, peer: &PeerId) -> SyncResult<KnownPeer> {
        self.host
            .peer(peer)
            .await
            .ok_or_else(|| SyncError::PeerNotFound(peer.to_string()))
    }

    /// Pulls the peer's changes into the local store.
    ///
    /// Returns an empty summary when a pull from this peer is already
    /// running.
    pub async fn replicate_from(&self, peer: &PeerId) -> SyncResult<ReplicationSummary> {
        let result = self.try_replicate_from(peer).await;
        if let Err(e) = &result {
            warn!(%peer, "could not replicate from peer: {e}");
            self.emit(SessionEvent::ReplicationFailed {
                peer: peer.clone(),
                direction: Direction::From,
                message: e.to_string(),
            });
        }
        result
    }

    async fn try_replicate_from(&self, peer: &PeerId) -> SyncResult<ReplicationSummary> {
        let known = self.known_peer(peer).await?;

        let auth: AuthReply = self
            .host
            .client(peer)
            .call_typed(methods::REQUEST_AUTHENTICATION, &Value::Null, None)
            .await?;
        if !auth.accepted {
            return Err(SyncError::PolicyDenied {
                reason: format!("{} did not accept this device", known.name),
            });
        }

        let remote: TweakValues = self
            .host
            .client(peer)
            .call_typed(methods::GET_TWEAK_VALUES, &Value::Null, None)
            .await?;
        let settings = self.caps.settings.current();
        let comparison = TweakValues::compare(&settings, &remote);
        if !comparison.is_compatible() || !comparison.differences.is_empty() {
            self.emit(SessionEvent::TweakMismatch {
                peer: peer.clone(),
                differences: comparison.differences.clone(),
                fatal: comparison.passphrase_mismatch,
            });
        }
        if comparison.passphrase_mismatch {
            return Err(SyncError::Incompatible(format!(
                "passphrase differs from {}",
                known.name
            )));
        }
        if !comparison.differences.is_empty() {
            warn!(
                %peer,
                differences = ?comparison.differences,
                "peer settings differ, replicating anyway"
            );
        }

        let Some(_active) = ActiveGuard::enter(&self.replicating_from, peer) else {
            debug!(%peer, "already replicating from peer");
            return Ok(ReplicationSummary::default());
        };
        self.emit(SessionEvent::ReplicationStarted {
            peer: peer.clone(),
            direction: Direction::From,
        });

        let source = RemoteDocumentStore::new(format!("peer:{}", known.name), self.host.client(peer));
        let observer = PullObserver {
            host: Arc::clone(&self.host),
            events: self.events.clone(),
            peer: peer.clone(),
        };
        let options = ReplicationOptions {
            batch_size: settings.batch_size,
            ..Default::default()
        };
        let summary = self
            .replicator
            .replicate(self.local.as_ref(), &source, &observer, &options)
            .await?;

        self.emit(SessionEvent::ReplicationFinished {
            peer: peer.clone(),
            direction: Direction::From,
            docs_written: summary.docs_written,
        });
        Ok(summary)
    }

    /// Asks the peer to pull our changes. Returns `Ok(false)` when a push
    /// to this peer is already running.
    pub async fn replicate_to(&self, peer: &PeerId) -> SyncResult<bool> {
        let result = self.try_replicate_to(peer).await;
        if let Err(e) = &result {
            warn!(%peer, "could not replicate to peer: {e}");
            self.emit(SessionEvent::ReplicationFailed {
                peer: peer.clone(),
                direction: Direction::To,
                message: e.to_string(),
            });
        }
        result
    }

    async fn try_replicate_to(&self, peer: &PeerId) -> SyncResult<bool> {
        self.known_peer(peer).await?;
        let Some(_active) = ActiveGuard::enter(&self.replicating_to, peer) else {
            debug!(%peer, "already replicating to peer");
            return Ok(false);
        };
        self.emit(SessionEvent::ReplicationStarted {
            peer: peer.clone(),
            direction: Direction::To,
        });

        // The pull runs on the peer and may be long. The call also fails
        // as soon as the peer leaves.
        let reply: PullReply = self
            .host
            .client(peer)
            .call_typed(methods::REQUEST_PULL, &Value::Null, Some(PULL_TIMEOUT))
            .await?;
        self.emit(SessionEvent::ReplicationFinished {
            peer: peer.clone(),
            direction: Direction::To,
            docs_written: reply.docs_written,
        });
        Ok(true)
    }

    /// Pushes to every known peer at once. Returns `None` when a previous
    /// call is still running.
    pub async fn sync_all_peers(&self) -> Option<Vec<(PeerId, SyncResult<bool>)>> {
        if self.syncing_all.swap(true, Ordering::SeqCst) {
            debug!("sync of all peers already running");
            return None;
        }
        let _flag = FlagGuard(&self.syncing_all);

        let peers = self.host.known_peers().await;
        let results = futures::future::join_all(peers.iter().map(|p| async move {
            (p.peer_id.clone(), self.replicate_to(&p.peer_id).await)
        }))
        .await;
        Some(results)
    }

    // ── Live broadcast ───────────────────────────────────────────

    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting.load(Ordering::SeqCst)
    }

    /// Last local sequence announced to peers.
    pub fn last_broadcast_seq(&self) -> Option<Seq> {
        self.last_broadcast_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Announces every local change from now on to accepted peers.
    pub fn start_broadcast(self: &Arc<Self>) -> SyncResult<()> {
        if self.broadcasting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut feed = match self.local.watch_changes() {
            Ok(feed) => feed,
            Err(e) => {
                self.broadcasting.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        info!("broadcasting local changes");
        self.emit(SessionEvent::BroadcastStarted);

        let weak = Arc::downgrade(self);
        let broadcasting = Arc::clone(&self.broadcasting);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                let entry = match feed.next().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => {
                        debug!("local change feed completed");
                        break;
                    }
                    Err(e) => {
                        warn!("local change feed failed: {e}");
                        break;
                    }
                };
                if entry.id.is_local() {
                    continue;
                }
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.announce(entry.seq).await;
            }
            broadcasting.store(false, Ordering::SeqCst);
            let _ = events.send(SessionEvent::BroadcastStopped);
        });
        if let Some(old) = self
            .broadcast_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            old.abort();
        }
        Ok(())
    }

    /// Stops announcing local changes.
    pub fn stop_broadcast(&self) {
        let task = self
            .broadcast_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            if self.broadcasting.swap(false, Ordering::SeqCst) {
                self.emit(SessionEvent::BroadcastStopped);
            }
        }
    }

    async fn announce(&self, seq: Seq) {
        *self
            .last_broadcast_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(seq.clone());

        let args = json!({ "lastSeq": seq });
        for peer in self.host.known_peers().await {
            let accepted = self
                .acceptance
                .cached_decision(&peer.peer_id, &peer.name)
                .is_some_and(|d| d.is_accepted());
            if !accepted {
                continue;
            }
            let lock = {
                let mut locks = self
                    .notify_locks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                Arc::clone(locks.entry(peer.peer_id.clone()).or_default())
            };
            let host = Arc::clone(&self.host);
            let args = args.clone();
            tokio::spawn(async move {
                let _serial = lock.lock().await;
                if let Err(e) = host
                    .call(&peer.peer_id, methods::NOTIFY_CHANGES, args, None)
                    .await
                {
                    debug!(peer = %peer.peer_id, "change notification failed: {e}");
                }
            });
        }
    }
}

/// Upper bound for a peer-side pull started by `requestPull`.
const PULL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

fn upgrade(weak: &Weak<PeerSession>) -> SyncResult<Arc<PeerSession>> {
    weak.upgrade().ok_or(SyncError::ChannelClosed)
}
