use docmesh_sync::MeshTransport;
use docmesh_sync::p2p::{Keypair, P2pConfig, P2pMesh, room_hash};
use docmesh_types::PeerId;
use libp2p::PeerId as Libp2pPeerId;
use std::time::Duration;

// ── Config ──────────────────────────────────────────────────────

#[test]
fn config_defaults() {
    let config = P2pConfig::default();
    assert_eq!(config.room, "docmesh");
    assert_eq!(config.listen_addrs.len(), 2);
    assert!(config.bootstrap_nodes.is_empty());
    assert!(config.enable_mdns);
    assert!(config.enable_dht);
    assert_eq!(config.idle_timeout, Duration::from_secs(60));
    assert_eq!(config.request_timeout, Duration::from_secs(120));
}

#[test]
fn room_hash_is_stable_per_room() {
    assert_eq!(room_hash("notes"), room_hash("notes"));
    assert_ne!(room_hash("notes"), room_hash("Notes"));
    assert_eq!(room_hash("notes").len(), 32);
}

// ── Identity ────────────────────────────────────────────────────

#[tokio::test]
async fn new_mesh_is_idle() {
    let mesh = P2pMesh::new(P2pConfig {
        room: "notes".into(),
        ..Default::default()
    });

    assert!(!mesh.is_running());
    assert_eq!(mesh.room(), "notes");
    assert!(mesh.connected_peers().await.is_empty());
    assert_eq!(mesh.local_peer_id().as_str(), mesh.libp2p_peer_id().to_string());
}

#[test]
fn keypair_determines_peer_id() {
    let keypair = Keypair::generate_ed25519();
    let expected: Libp2pPeerId = keypair.public().into();

    let mesh = P2pMesh::with_keypair(keypair, P2pConfig::default());
    assert_eq!(mesh.libp2p_peer_id(), expected);
    assert_eq!(P2pMesh::map_peer_id(&expected), mesh.local_peer_id());
}

#[tokio::test]
async fn sending_while_stopped_fails() {
    let mesh = P2pMesh::new(P2pConfig::default());
    let other = PeerId::from_string(Keypair::generate_ed25519().public().to_peer_id().to_string());

    assert!(mesh.send(&other, b"x".to_vec()).await.is_err());
    assert!(mesh.send(&PeerId::from_string("not-a-peer-id"), Vec::new()).await.is_err());
}

#[tokio::test]
async fn recv_without_start_is_none() {
    let mesh = P2pMesh::new(P2pConfig::default());
    assert!(mesh.recv_event().await.is_none());
}
