//! Mesh transport implementation using a libp2p swarm.

use crate::error::{SyncError, SyncResult};
use crate::p2p::behaviour::{AGENT_PREFIX, MeshBehaviour, MeshBehaviourEvent};
use crate::p2p::codec::{MeshAck, MeshFrame};
use crate::transport::{MeshEvent, MeshTransport};
use async_trait::async_trait;
use docmesh_types::PeerId;
use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId as Libp2pPeerId, Swarm,
    identity::Keypair,
    kad, mdns,
    multiaddr::Protocol,
    request_response::{self, OutboundRequestId},
    swarm::SwarmEvent,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Configuration for the P2P mesh.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Room to join. Only peers in the same room exchange frames.
    pub room: String,
    /// Listen addresses.
    pub listen_addrs: Vec<Multiaddr>,
    /// Bootstrap nodes for DHT discovery.
    pub bootstrap_nodes: Vec<Multiaddr>,
    /// Enable mDNS discovery (local network only).
    pub enable_mdns: bool,
    /// Enable room records on the Kademlia DHT.
    pub enable_dht: bool,
    /// Connection idle timeout.
    pub idle_timeout: Duration,
    /// How long a frame may wait for its acknowledgement.
    pub request_timeout: Duration,
    /// How often the room record is republished and queried.
    pub discovery_interval: Duration,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            room: "docmesh".to_string(),
            listen_addrs: vec![
                Multiaddr::empty()
                    .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                    .with(Protocol::Udp(0))
                    .with(Protocol::QuicV1),
                Multiaddr::empty()
                    .with(Protocol::Ip6(Ipv6Addr::UNSPECIFIED))
                    .with(Protocol::Udp(0))
                    .with(Protocol::QuicV1),
            ],
            bootstrap_nodes: Vec::new(),
            enable_mdns: true,
            enable_dht: true,
            idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(120),
            discovery_interval: Duration::from_secs(30),
        }
    }
}

/// SHA-256 of the room name; used for DHT keys and identify matching.
#[must_use]
pub fn room_hash(room: &str) -> Vec<u8> {
    Sha256::digest(room.as_bytes()).to_vec()
}

/// Command sent to the swarm event loop.
enum SwarmCommand {
    /// Deliver a frame to a peer.
    Send {
        peer_id: Libp2pPeerId,
        frame: MeshFrame,
        ack_tx: oneshot::Sender<SyncResult<()>>,
    },
}

struct EventLoop {
    swarm: Swarm<MeshBehaviour>,
    command_rx: mpsc::Receiver<SwarmCommand>,
    event_tx: mpsc::UnboundedSender<MeshEvent>,
    members: Arc<RwLock<HashSet<Libp2pPeerId>>>,
    running: Arc<AtomicBool>,
    room: String,
    room_hash: Vec<u8>,
    agent_version: String,
    enable_dht: bool,
    discovery_interval: Duration,
    local_libp2p_peer_id: Libp2pPeerId,
    pending: HashMap<OutboundRequestId, oneshot::Sender<SyncResult<()>>>,
    listen_addresses: Vec<Multiaddr>,
}

/// Mesh transport over libp2p (QUIC, mDNS, Kademlia, identify).
pub struct P2pMesh {
    libp2p_peer_id: Libp2pPeerId,
    keypair: Keypair,
    config: P2pConfig,
    members: Arc<RwLock<HashSet<Libp2pPeerId>>>,
    command_tx: Mutex<Option<mpsc::Sender<SwarmCommand>>>,
    event_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    running: Arc<AtomicBool>,
}

impl P2pMesh {
    /// Creates a mesh with a random keypair.
    pub fn new(config: P2pConfig) -> Self {
        Self::with_keypair(Keypair::generate_ed25519(), config)
    }

    /// Creates a mesh with a specific keypair.
    pub fn with_keypair(keypair: Keypair, config: P2pConfig) -> Self {
        Self {
            libp2p_peer_id: Libp2pPeerId::from(keypair.public()),
            keypair,
            config,
            members: Arc::new(RwLock::new(HashSet::new())),
            command_tx: Mutex::new(None),
            event_rx: tokio::sync::Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns our libp2p peer ID.
    pub fn libp2p_peer_id(&self) -> Libp2pPeerId {
        self.libp2p_peer_id
    }

    /// Maps a libp2p peer id to a mesh peer id.
    pub fn map_peer_id(libp2p_id: &Libp2pPeerId) -> PeerId {
        PeerId::from_string(libp2p_id.to_string())
    }

    fn parse_peer_id(peer: &PeerId) -> SyncResult<Libp2pPeerId> {
        peer.as_str()
            .parse()
            .map_err(|_| SyncError::PeerNotFound(peer.to_string()))
    }

    fn create_swarm(&self, room_hash: &[u8]) -> SyncResult<Swarm<MeshBehaviour>> {
        let behaviour = MeshBehaviour::new(
            self.libp2p_peer_id,
            &self.keypair,
            &self.config.bootstrap_nodes,
            self.config.enable_mdns,
            room_hash,
            self.config.request_timeout,
        )?;

        let swarm = libp2p::SwarmBuilder::with_existing_identity(self.keypair.clone())
            .with_tokio()
            .with_quic()
            .with_behaviour(|_| behaviour)
            .map_err(|e| SyncError::Network(format!("failed to create behaviour: {e}")))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(self.config.idle_timeout))
            .build();

        Ok(swarm)
    }

    fn command_tx(&self) -> SyncResult<mpsc::Sender<SwarmCommand>> {
        self.command_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| SyncError::Network("transport not running".to_string()))
    }
}

impl EventLoop {
    async fn run(mut self) {
        let mut discovery = tokio::time::interval(self.discovery_interval);

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event).await,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                _ = discovery.tick() => {
                    if self.enable_dht {
                        let hash = self.room_hash.clone();
                        let addrs = self.listen_addresses.clone();
                        self.swarm.behaviour_mut().publish_room(&hash, &addrs);
                        self.swarm.behaviour_mut().discover_room(&hash);
                    }
                }
            }
        }

        for (_, ack_tx) in self.pending.drain() {
            let _ = ack_tx.send(Err(SyncError::ChannelClosed));
        }
        info!("P2P mesh event loop stopped");
    }

    fn dial(&mut self, peer_id: Libp2pPeerId, addresses: impl IntoIterator<Item = Multiaddr>) {
        if peer_id == self.local_libp2p_peer_id {
            return;
        }
        for addr in addresses {
            self.swarm.add_peer_address(peer_id, addr);
        }
        if !self.swarm.is_connected(&peer_id) {
            if let Err(e) = self.swarm.dial(peer_id) {
                debug!("Dial {peer_id} failed: {e}");
            }
        }
    }

    async fn mark_member(&mut self, peer_id: Libp2pPeerId) {
        if self.members.write().await.insert(peer_id) {
            info!("Peer {peer_id} joined room {}", self.room);
            let _ = self.event_tx.send(MeshEvent::Joined(P2pMesh::map_peer_id(&peer_id)));
        }
    }

    async fn on_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    debug!("mDNS discovered peer: {peer_id} at {addr}");
                    self.dial(peer_id, [addr]);
                }
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed { result, .. },
            )) => match result {
                kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(peer_record))) => {
                    let Some(publisher) = peer_record.record.publisher else {
                        return;
                    };
                    let addresses: Vec<Multiaddr> =
                        serde_json::from_slice::<serde_json::Value>(&peer_record.record.value)
                            .ok()
                            .and_then(|v| {
                                v.get("addresses")?.as_array().map(|arr| {
                                    arr.iter().filter_map(|a| a.as_str()?.parse().ok()).collect()
                                })
                            })
                            .unwrap_or_default();
                    debug!("DHT discovered room peer: {publisher}");
                    self.dial(publisher, addresses);
                }
                kad::QueryResult::GetRecord(Err(e)) => debug!("DHT get record failed: {e:?}"),
                kad::QueryResult::PutRecord(Err(e)) => warn!("Failed to publish room record: {e:?}"),
                kad::QueryResult::Bootstrap(Err(e)) => warn!("Kademlia bootstrap failed: {e:?}"),
                _ => {}
            },
            SwarmEvent::Behaviour(MeshBehaviourEvent::Identify(libp2p::identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in &info.listen_addrs {
                    self.swarm.add_peer_address(peer_id, addr.clone());
                }
                if info.agent_version == self.agent_version {
                    self.mark_member(peer_id).await;
                } else if info.agent_version.starts_with(AGENT_PREFIX) {
                    debug!("Peer {peer_id} is in another room");
                }
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::MeshProtocol(event)) => {
                self.on_mesh_protocol(event).await;
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!("Connection closed with {peer_id}: {cause:?}");
                if num_established == 0 && self.members.write().await.remove(&peer_id) {
                    info!("Peer {peer_id} left room {}", self.room);
                    let _ = self.event_tx.send(MeshEvent::Left(P2pMesh::map_peer_id(&peer_id)));
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {address}");
                self.listen_addresses.push(address);
            }
            _ => {}
        }
    }

    async fn on_mesh_protocol(&mut self, event: request_response::Event<MeshFrame, MeshAck>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    let accepted = request.room == self.room;
                    if self
                        .swarm
                        .behaviour_mut()
                        .mesh_protocol
                        .send_response(channel, MeshAck { accepted })
                        .is_err()
                    {
                        warn!("Failed to acknowledge frame (channel closed)");
                    }
                    if !accepted {
                        debug!("Dropped frame for room {} from {peer}", request.room);
                        return;
                    }
                    self.mark_member(peer).await;
                    let _ = self.event_tx.send(MeshEvent::Message {
                        from: P2pMesh::map_peer_id(&peer),
                        payload: request.payload,
                    });
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(ack_tx) = self.pending.remove(&request_id) {
                        let result = if response.accepted {
                            Ok(())
                        } else {
                            Err(SyncError::Network(format!("{peer} is not in this room")))
                        };
                        let _ = ack_tx.send(result);
                    }
                }
            },
            request_response::Event::OutboundFailure {
                request_id, error, ..
            } => {
                if let Some(ack_tx) = self.pending.remove(&request_id) {
                    let _ = ack_tx.send(Err(SyncError::Network(format!(
                        "outbound frame failed: {error:?}"
                    ))));
                }
            }
            request_response::Event::InboundFailure { error, .. } => {
                warn!("Inbound frame failed: {error:?}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn on_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Send {
                peer_id,
                frame,
                ack_tx,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .mesh_protocol
                    .send_request(&peer_id, frame);
                self.pending.insert(request_id, ack_tx);
            }
        }
    }
}

#[async_trait]
impl MeshTransport for P2pMesh {
    async fn start(&self) -> SyncResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let room_hash = room_hash(&self.config.room);
        let mut swarm = self.create_swarm(&room_hash)?;
        for addr in &self.config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| SyncError::Network(format!("failed to listen on {addr}: {e}")))?;
        }

        self.running.store(true, Ordering::SeqCst);
        self.members.write().await.clear();

        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        *self.command_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(command_tx);
        *self.event_rx.lock().await = Some(event_rx);

        let event_loop = EventLoop {
            swarm,
            command_rx,
            event_tx,
            members: Arc::clone(&self.members),
            running: Arc::clone(&self.running),
            room: self.config.room.clone(),
            agent_version: format!("{AGENT_PREFIX}{}", hex::encode(&room_hash)),
            room_hash,
            enable_dht: self.config.enable_dht,
            discovery_interval: self.config.discovery_interval,
            local_libp2p_peer_id: self.libp2p_peer_id,
            pending: HashMap::new(),
            listen_addresses: Vec::new(),
        };
        tokio::spawn(event_loop.run());

        info!(
            "P2P mesh started in room {}, libp2p peer ID: {}",
            self.config.room, self.libp2p_peer_id
        );
        Ok(())
    }

    async fn stop(&self) -> SyncResult<()> {
        self.running.store(false, Ordering::SeqCst);
        // Dropping the command sender wakes the event loop so it can exit.
        self.command_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("P2P mesh stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn local_peer_id(&self) -> PeerId {
        Self::map_peer_id(&self.libp2p_peer_id)
    }

    fn room(&self) -> &str {
        &self.config.room
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.members
            .read()
            .await
            .iter()
            .map(Self::map_peer_id)
            .collect()
    }

    async fn send(&self, peer: &PeerId, payload: Vec<u8>) -> SyncResult<()> {
        let peer_id = Self::parse_peer_id(peer)?;
        if !self.members.read().await.contains(&peer_id) {
            return Err(SyncError::PeerNotFound(peer.to_string()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx()?
            .send(SwarmCommand::Send {
                peer_id,
                frame: MeshFrame {
                    room: self.config.room.clone(),
                    payload,
                },
                ack_tx,
            })
            .await
            .map_err(|_| SyncError::Network("command channel closed".to_string()))?;

        ack_rx
            .await
            .map_err(|_| SyncError::Network("ack channel closed".to_string()))?
    }

    async fn broadcast(&self, payload: Vec<u8>) -> SyncResult<()> {
        for peer in self.connected_peers().await {
            if let Err(e) = self.send(&peer, payload.clone()).await {
                debug!(%peer, "broadcast skipped peer: {e}");
            }
        }
        Ok(())
    }

    async fn recv_event(&self) -> Option<MeshEvent> {
        let mut guard = self.event_rx.lock().await;
        let rx = guard.as_mut()?;
        rx.recv().await
    }
}
