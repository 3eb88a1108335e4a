use docmesh_sync::protocol::{Advertisement, MeshMessage, RpcFrame};
use docmesh_sync::transport::memory::{MemoryHub, MemoryMesh};
use docmesh_sync::{HostEvent, MeshTransport, PeerHost, SyncError};
use docmesh_types::PeerId;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::wait_for_peers;

fn host(hub: &Arc<MemoryHub>, name: &str) -> Arc<PeerHost> {
    PeerHost::new(
        Arc::new(MemoryMesh::new(hub.clone(), "host")),
        name,
        "linux",
        Some(Duration::from_secs(2)),
    )
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<HostEvent>) -> HostEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("host event")
        .unwrap()
}

// ── Advertisement ───────────────────────────────────────────────

#[tokio::test]
async fn peers_discover_each_other() {
    let hub = MemoryHub::new();
    let a = host(&hub, "alice");
    let b = host(&hub, "bob");
    let mut events = a.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();

    match next_event(&mut events).await {
        HostEvent::PeerDiscovered(peer) => {
            assert_eq!(peer.name, "bob");
            assert_eq!(peer.peer_id, b.local_peer_id());
            assert_eq!(peer.platform, "linux");
        }
        other => panic!("expected discovery, got {other:?}"),
    }
    wait_for_peers(&b, 1).await;
    assert_eq!(b.known_peers().await[0].name, "alice");
}

#[tokio::test]
async fn peer_using_our_name_is_ignored() {
    let hub = MemoryHub::new();
    let a = host(&hub, "laptop");
    let b = host(&hub, "laptop");
    a.start().await.unwrap();
    b.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.known_peers().await.is_empty());
    assert!(b.known_peers().await.is_empty());
}

#[tokio::test]
async fn second_peer_with_a_taken_name_is_ignored() {
    let hub = MemoryHub::new();
    let a = host(&hub, "alice");
    let b = host(&hub, "bob");
    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_for_peers(&a, 1).await;

    let impostor = Arc::new(MemoryMesh::new(hub.clone(), "host"));
    impostor.start().await.unwrap();
    let ad = MeshMessage::Advertise(Advertisement::new(impostor.local_peer_id(), "bob", "evil"));
    impostor
        .send(&a.local_peer_id(), ad.to_bytes().unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let peers = a.known_peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, b.local_peer_id());
}

#[tokio::test]
async fn readvertising_does_not_rediscover() {
    let hub = MemoryHub::new();
    let a = host(&hub, "alice");
    let b = host(&hub, "bob");
    let mut events = a.subscribe();
    a.start().await.unwrap();
    b.start().await.unwrap();
    assert!(matches!(next_event(&mut events).await, HostEvent::PeerDiscovered(_)));

    // Restarting bob's advertisement loop re-broadcasts the same identity.
    b.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

// ── Leaving ─────────────────────────────────────────────────────

#[tokio::test]
async fn leaving_peer_is_forgotten() {
    let hub = MemoryHub::new();
    let a = host(&hub, "alice");
    let b = host(&hub, "bob");
    let mut events = a.subscribe();
    a.start().await.unwrap();
    b.start().await.unwrap();
    assert!(matches!(next_event(&mut events).await, HostEvent::PeerDiscovered(_)));

    let bob_id = b.local_peer_id();
    b.stop().await.unwrap();

    assert_eq!(next_event(&mut events).await, HostEvent::PeerLeft(bob_id.clone()));
    assert!(a.known_peers().await.is_empty());
    assert!(a.peer(&bob_id).await.is_none());
}

#[tokio::test]
async fn responses_from_strangers_do_not_create_clients() {
    let hub = MemoryHub::new();
    let a = host(&hub, "alice");
    a.start().await.unwrap();

    let stranger = Arc::new(MemoryMesh::new(hub.clone(), "host"));
    stranger.start().await.unwrap();
    let request = RpcFrame::request("db.info", 7, Value::Null);
    let response = MeshMessage::Rpc(RpcFrame::response(&request, Value::Null));
    stranger
        .send(&a.local_peer_id(), response.to_bytes().unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.client_count(), 0);
}

#[tokio::test]
async fn departed_peer_leaves_no_client_behind() {
    let hub = MemoryHub::new();
    let a = host(&hub, "alice");
    let b = host(&hub, "bob");
    let mut events = a.subscribe();
    a.start().await.unwrap();
    b.start().await.unwrap();
    assert!(matches!(next_event(&mut events).await, HostEvent::PeerDiscovered(_)));
    a.client(&b.local_peer_id());
    assert_eq!(a.client_count(), 1);

    b.stop().await.unwrap();
    assert!(matches!(next_event(&mut events).await, HostEvent::PeerLeft(_)));
    assert_eq!(a.client_count(), 0);
}

#[tokio::test]
async fn calling_an_unknown_peer_fails() {
    let hub = MemoryHub::new();
    let a = host(&hub, "alice");
    a.start().await.unwrap();

    let err = a
        .call(&PeerId::from_string("ghost"), "db.info", Value::Null, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::PeerNotFound(_)));
}
