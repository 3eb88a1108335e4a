//! Mesh transport abstraction.
//!
//! A mesh delivers opaque payloads between peers that joined the same named
//! room. It knows nothing about advertisements or RPC; those live in
//! [`crate::host`]. Implementations: [`memory::MemoryMesh`] (in-process) and
//! [`crate::p2p::P2pMesh`] (libp2p).

use crate::error::SyncResult;
use async_trait::async_trait;
use docmesh_types::PeerId;

/// Something that happened on the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A peer joined the room (or became reachable).
    Joined(PeerId),
    /// A peer left the room (or became unreachable).
    Left(PeerId),
    /// A payload from a peer in the room.
    Message { from: PeerId, payload: Vec<u8> },
}

/// Point-to-point reliable delivery within a room.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Joins the room. Calling it twice is a no-op.
    async fn start(&self) -> SyncResult<()>;

    /// Leaves the room; `recv_event` returns `None` afterwards.
    async fn stop(&self) -> SyncResult<()>;

    /// Returns whether the transport is running.
    fn is_running(&self) -> bool;

    /// Our id on this mesh.
    fn local_peer_id(&self) -> PeerId;

    /// The room name.
    fn room(&self) -> &str;

    /// Peers currently reachable in the room.
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Delivers a payload to one peer.
    async fn send(&self, peer: &PeerId, payload: Vec<u8>) -> SyncResult<()>;

    /// Delivers a payload to every peer in the room.
    async fn broadcast(&self, payload: Vec<u8>) -> SyncResult<()>;

    /// Receives the next mesh event.
    /// Returns `None` if the transport is shutting down.
    async fn recv_event(&self) -> Option<MeshEvent>;
}

/// In-process mesh for tests and loopback deployments.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::mpsc;
    use tracing::debug;

    type Inbox = mpsc::UnboundedSender<MeshEvent>;

    /// Shared switchboard: room name to member inboxes.
    #[derive(Debug, Default)]
    pub struct MemoryHub {
        rooms: Mutex<HashMap<String, HashMap<PeerId, Inbox>>>,
    }

    impl MemoryHub {
        /// Creates an empty hub.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn with_rooms<R>(&self, f: impl FnOnce(&mut HashMap<String, HashMap<PeerId, Inbox>>) -> R) -> R {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut rooms)
        }

        fn join(&self, room: &str, peer: &PeerId, inbox: Inbox) {
            self.with_rooms(|rooms| {
                let members = rooms.entry(room.to_string()).or_default();
                for (other, other_inbox) in members.iter() {
                    let _ = other_inbox.send(MeshEvent::Joined(peer.clone()));
                    let _ = inbox.send(MeshEvent::Joined(other.clone()));
                }
                members.insert(peer.clone(), inbox);
            });
        }

        fn leave(&self, room: &str, peer: &PeerId) {
            self.with_rooms(|rooms| {
                if let Some(members) = rooms.get_mut(room) {
                    members.remove(peer);
                    for inbox in members.values() {
                        let _ = inbox.send(MeshEvent::Left(peer.clone()));
                    }
                }
            });
        }

        fn members(&self, room: &str) -> Vec<PeerId> {
            self.with_rooms(|rooms| {
                rooms
                    .get(room)
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default()
            })
        }

        fn deliver(&self, room: &str, from: &PeerId, to: &PeerId, payload: Vec<u8>) -> SyncResult<()> {
            self.with_rooms(|rooms| {
                let inbox = rooms
                    .get(room)
                    .and_then(|m| m.get(to))
                    .ok_or_else(|| SyncError::PeerNotFound(to.to_string()))?;
                inbox
                    .send(MeshEvent::Message {
                        from: from.clone(),
                        payload,
                    })
                    .map_err(|_| SyncError::ChannelClosed)
            })
        }
    }

    /// A member of a [`MemoryHub`] room.
    pub struct MemoryMesh {
        hub: Arc<MemoryHub>,
        room: String,
        peer_id: PeerId,
        running: AtomicBool,
        inbox_tx: Mutex<Option<Inbox>>,
        inbox_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    }

    impl MemoryMesh {
        /// Creates a member with a fresh peer id.
        pub fn new(hub: Arc<MemoryHub>, room: impl Into<String>) -> Self {
            Self::with_peer_id(hub, room, PeerId::new())
        }

        /// Creates a member with a chosen peer id.
        pub fn with_peer_id(hub: Arc<MemoryHub>, room: impl Into<String>, peer_id: PeerId) -> Self {
            Self {
                hub,
                room: room.into(),
                peer_id,
                running: AtomicBool::new(false),
                inbox_tx: Mutex::new(None),
                inbox_rx: tokio::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl MeshTransport for MemoryMesh {
        async fn start(&self) -> SyncResult<()> {
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.inbox_rx.lock().await = Some(rx);
            *self.inbox_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());
            self.hub.join(&self.room, &self.peer_id, tx);
            Ok(())
        }

        async fn stop(&self) -> SyncResult<()> {
            if !self.running.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            self.hub.leave(&self.room, &self.peer_id);
            // Dropping the last sender ends `recv_event`.
            self.inbox_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn local_peer_id(&self) -> PeerId {
            self.peer_id.clone()
        }

        fn room(&self) -> &str {
            &self.room
        }

        async fn connected_peers(&self) -> Vec<PeerId> {
            self.hub
                .members(&self.room)
                .into_iter()
                .filter(|p| *p != self.peer_id)
                .collect()
        }

        async fn send(&self, peer: &PeerId, payload: Vec<u8>) -> SyncResult<()> {
            if !self.is_running() {
                return Err(SyncError::Network("transport not running".to_string()));
            }
            self.hub.deliver(&self.room, &self.peer_id, peer, payload)
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
            let mut guard = self.inbox_rx.lock().await;
            let rx = guard.as_mut()?;
            rx.recv().await
        }
    }
}
