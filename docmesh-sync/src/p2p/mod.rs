//! libp2p-based mesh transport.
//!
//! Provides peer discovery via mDNS (local network) and Kademlia room
//! records (WAN), with encrypted QUIC connections. Peers announce the
//! SHA-256 of their room name through identify; only peers announcing the
//! same hash are reported as room members.

mod behaviour;
pub mod codec;
pub mod transport;

pub use codec::{MeshAck, MeshCodec, MeshFrame};
pub use libp2p::Multiaddr;
pub use libp2p::identity::Keypair;
pub use transport::{P2pConfig, P2pMesh, room_hash};
