//! Network behaviour combining discovery and the mesh frame protocol.

use crate::error::{SyncError, SyncResult};
use crate::p2p::codec::MeshCodec;
use libp2p::{
    Multiaddr, identify, kad, mdns,
    request_response::{self, ProtocolSupport},
    swarm::{NetworkBehaviour, behaviour::toggle::Toggle},
};
use std::iter;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// The mesh protocol identifier.
pub const MESH_PROTOCOL: &str = "/docmesh/mesh/1.0.0";

/// Agent-version prefix; the rest is the hex room hash.
pub const AGENT_PREFIX: &str = "docmesh/";

/// DHT record key prefix for room discovery.
const ROOM_DHT_PREFIX: &[u8] = b"/docmesh/room/";

/// Combined network behaviour for a docmesh peer.
#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    /// mDNS for local network peer discovery (optional).
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Kademlia DHT for WAN room discovery.
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Identify carries the room hash, so peers can tell who shares the room.
    pub identify: identify::Behaviour,
    /// Request-response for room frames.
    pub mesh_protocol: request_response::Behaviour<MeshCodec>,
}

impl MeshBehaviour {
    /// Creates the behaviour.
    pub fn new(
        local_peer_id: libp2p::PeerId,
        keypair: &libp2p::identity::Keypair,
        bootstrap_nodes: &[Multiaddr],
        enable_mdns: bool,
        room_hash: &[u8],
        request_timeout: Duration,
    ) -> SyncResult<Self> {
        let mdns = if enable_mdns {
            let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                .map_err(|e| SyncError::Network(format!("mDNS behaviour creation failed: {e}")))?;
            Toggle::from(Some(behaviour))
        } else {
            debug!("mDNS disabled");
            Toggle::from(None)
        };

        let store = kad::store::MemoryStore::new(local_peer_id);
        let mut kademlia_config = kad::Config::new(kad::PROTOCOL_NAME);
        kademlia_config.set_query_timeout(Duration::from_secs(60));
        let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kademlia_config);

        for addr in bootstrap_nodes {
            if let Some(peer_id) = extract_peer_id(addr) {
                kademlia.add_address(&peer_id, remove_peer_id_suffix(addr));
                info!("Added bootstrap node: {}", peer_id);
            } else {
                warn!("Bootstrap address missing peer ID: {}", addr);
            }
        }
        kademlia.set_mode(Some(kad::Mode::Server));
        if !bootstrap_nodes.is_empty() {
            if let Err(e) = kademlia.bootstrap() {
                warn!("Failed to trigger Kademlia bootstrap: {:?}", e);
            }
        }

        let identify = identify::Behaviour::new(
            identify::Config::new(MESH_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(format!("{AGENT_PREFIX}{}", hex::encode(room_hash))),
        );

        let mesh_protocol = request_response::Behaviour::new(
            iter::once((MESH_PROTOCOL, ProtocolSupport::Full)),
            request_response::Config::default().with_request_timeout(request_timeout),
        );

        Ok(Self {
            mdns,
            kademlia,
            identify,
            mesh_protocol,
        })
    }

    /// Publishes our addresses under the room's DHT key.
    pub fn publish_room(&mut self, room_hash: &[u8], addresses: &[Multiaddr]) {
        let value = serde_json::json!({
            "addresses": addresses.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "timestamp": SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        });
        let record = kad::Record {
            key: Self::room_key(room_hash),
            value: value.to_string().into_bytes(),
            publisher: None,
            expires: None,
        };
        if let Err(e) = self.kademlia.put_record(record, kad::Quorum::One) {
            warn!("Failed to publish room record: {e:?}");
        }
    }

    /// Queries the DHT for peers in the room.
    pub fn discover_room(&mut self, room_hash: &[u8]) -> kad::QueryId {
        self.kademlia.get_record(Self::room_key(room_hash))
    }

    fn room_key(room_hash: &[u8]) -> kad::RecordKey {
        let mut key = ROOM_DHT_PREFIX.to_vec();
        key.extend_from_slice(room_hash);
        kad::RecordKey::new(&key)
    }
}

/// Extract the PeerId from a multiaddr like /ip4/.../p2p/12D3KooW...
fn extract_peer_id(addr: &Multiaddr) -> Option<libp2p::PeerId> {
    addr.iter().find_map(|proto| match proto {
        libp2p::multiaddr::Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Remove the /p2p/... suffix from a multiaddr.
fn remove_peer_id_suffix(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|proto| !matches!(proto, libp2p::multiaddr::Protocol::P2p(_)))
        .collect()
}
