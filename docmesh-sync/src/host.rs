//! Peer host: mesh membership, advertisements and RPC plumbing.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Advertisement, MeshMessage, RpcDirection, RpcFrame};
use crate::rpc::{RpcClient, RpcServer};
use crate::transport::{MeshEvent, MeshTransport};
use docmesh_types::PeerId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A peer that advertised itself in our room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    /// Transport id the advertisement arrived from.
    pub peer_id: PeerId,
    pub name: String,
    pub platform: String,
}

/// Membership notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    PeerDiscovered(KnownPeer),
    PeerLeft(PeerId),
}

/// Owns a mesh transport and turns it into named peers plus RPC.
pub struct PeerHost {
    transport: Arc<dyn MeshTransport>,
    advertisement: Advertisement,
    known: RwLock<HashMap<PeerId, KnownPeer>>,
    clients: Mutex<HashMap<PeerId, Arc<RpcClient>>>,
    server: Arc<RpcServer>,
    events: broadcast::Sender<HostEvent>,
    rpc_timeout: Option<Duration>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerHost {
    /// Creates a host that will advertise `name`/`platform` once started.
    pub fn new(
        transport: Arc<dyn MeshTransport>,
        name: impl Into<String>,
        platform: impl Into<String>,
        rpc_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let advertisement = Advertisement::new(transport.local_peer_id(), name, platform);
        Arc::new(Self {
            transport,
            advertisement,
            known: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            server: Arc::new(RpcServer::new()),
            events,
            rpc_timeout,
            receive_task: Mutex::new(None),
        })
    }

    /// Joins the room, starts the receive loop and announces ourselves.
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        self.transport.start().await?;

        let host = Arc::clone(self);
        let task = tokio::spawn(async move { host.receive_loop().await });
        if let Some(old) = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            old.abort();
        }

        let bytes = MeshMessage::Advertise(self.advertisement.clone()).to_bytes()?;
        self.transport.broadcast(bytes).await?;
        info!(
            name = %self.advertisement.name,
            room = self.transport.room(),
            "peer host started"
        );
        Ok(())
    }

    /// Leaves the room and rejects all pending calls.
    pub async fn stop(&self) -> SyncResult<()> {
        if let Some(task) = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let clients: Vec<_> = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, client) in clients {
            client.close();
        }
        self.known.write().await.clear();
        self.transport.stop().await
    }

    /// Our transport id.
    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    /// Our advertised name.
    pub fn name(&self) -> &str {
        &self.advertisement.name
    }

    /// The inbound method table.
    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    /// Subscribes to membership notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Peers that advertised themselves and have not left.
    pub async fn known_peers(&self) -> Vec<KnownPeer> {
        let mut peers: Vec<KnownPeer> = self.known.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    /// Looks up a known peer.
    pub async fn peer(&self, peer_id: &PeerId) -> Option<KnownPeer> {
        self.known.read().await.get(peer_id).cloned()
    }

    /// Returns the RPC client bound to a peer, creating it on first use.
    pub fn client(&self, peer_id: &PeerId) -> Arc<RpcClient> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(clients.entry(peer_id.clone()).or_insert_with(|| {
            Arc::new(RpcClient::new(
                peer_id.clone(),
                Arc::clone(&self.transport),
                self.rpc_timeout,
            ))
        }))
    }

    fn existing_client(&self, peer_id: &PeerId) -> Option<Arc<RpcClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }

    /// Number of live RPC clients.
    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Calls a method on a known peer.
    pub async fn call(
        &self,
        peer_id: &PeerId,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> SyncResult<Value> {
        if self.peer(peer_id).await.is_none() {
            return Err(SyncError::PeerNotFound(peer_id.to_string()));
        }
        self.client(peer_id).call(method, args, timeout).await
    }

    async fn receive_loop(self: Arc<Self>) {
        while let Some(event) = self.transport.recv_event().await {
            match event {
                MeshEvent::Joined(peer) => {
                    debug!(%peer, "mesh peer joined");
                    match MeshMessage::Advertise(self.advertisement.clone()).to_bytes() {
                        Ok(bytes) => {
                            if let Err(e) = self.transport.send(&peer, bytes).await {
                                debug!(%peer, "failed to advertise to new peer: {e}");
                            }
                        }
                        Err(e) => warn!("failed to encode advertisement: {e}"),
                    }
                }
                MeshEvent::Left(peer) => self.on_left(&peer).await,
                MeshEvent::Message { from, payload } => match MeshMessage::from_bytes(&payload) {
                    Ok(MeshMessage::Advertise(ad)) => self.on_advertisement(from, ad).await,
                    Ok(MeshMessage::Rpc(frame)) => self.on_frame(from, frame),
                    Err(e) => warn!(peer = %from, "undecodable mesh payload: {e}"),
                },
            }
        }
        debug!("mesh event stream ended");
    }

    async fn on_left(&self, peer: &PeerId) {
        let removed = self.known.write().await.remove(peer);
        let client = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
        if let Some(client) = client {
            client.close();
        }
        if let Some(known) = removed {
            info!(peer = %peer, name = %known.name, "peer left");
            let _ = self.events.send(HostEvent::PeerLeft(peer.clone()));
        }
    }

    async fn on_advertisement(&self, from: PeerId, ad: Advertisement) {
        let local_id = self.transport.local_peer_id();
        if from == local_id || ad.peer_id == local_id {
            return;
        }
        if ad.name == self.advertisement.name {
            warn!(peer = %from, name = %ad.name, "ignoring advertisement using our own name");
            return;
        }

        let discovered = {
            let mut known = self.known.write().await;
            if known
                .values()
                .any(|p| p.name == ad.name && p.peer_id != from)
            {
                warn!(peer = %from, name = %ad.name, "ignoring advertisement with a name already in use");
                return;
            }
            let peer = KnownPeer {
                peer_id: from.clone(),
                name: ad.name,
                platform: ad.platform,
            };
            let is_new = known.insert(from, peer.clone()).is_none();
            is_new.then_some(peer)
        };

        if let Some(peer) = discovered {
            info!(peer = %peer.peer_id, name = %peer.name, "peer discovered");
            let _ = self.events.send(HostEvent::PeerDiscovered(peer));
        }
    }

    fn on_frame(self: &Arc<Self>, from: PeerId, frame: RpcFrame) {
        match frame.direction {
            RpcDirection::Response => match self.existing_client(&from) {
                Some(client) => client.handle_response(frame),
                None => debug!(peer = %from, seq = frame.seq, "dropping response from a peer we never called"),
            },
            RpcDirection::Request => {
                let host = Arc::clone(self);
                tokio::spawn(async move {
                    let Some(response) = host.server.dispatch(&from, frame).await else {
                        return;
                    };
                    let sent = match MeshMessage::Rpc(response).to_bytes() {
                        Ok(bytes) => host.transport.send(&from, bytes).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = sent {
                        debug!(peer = %from, "failed to send rpc response: {e}");
                    }
                });
            }
        }
    }
}
