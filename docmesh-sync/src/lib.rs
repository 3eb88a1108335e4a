//! Peer replication for docmesh.
//!
//! Documents move between replicas with a checkpointed, revision-diff based
//! protocol. Replicas are any [`docmesh_storage::DocumentStore`]: the local
//! store, a CouchDB-compatible server, or another peer reached over the
//! mesh.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Replicator**: one-shot delta transfer between two stores, resumable
//!   through `_local/` checkpoint documents
//! - **Transport**: a room-scoped mesh delivering opaque payloads (in-process
//!   or libp2p)
//! - **RPC / Host**: advertisements, request/response correlation and the
//!   served method table
//! - **Acceptance**: who may call us, by session, by name, by list or by asking
//! - **Session**: authenticate, compare tweaks, replicate; live change
//!   broadcast
//!
//! ## Pulling from a peer
//!
//! 1. **Authenticate**: `!requestAuthentication` (served without the gate)
//! 2. **Compare**: `getTweakValues`; a passphrase mismatch stops here
//! 3. **Replicate**: the peer's hosted store is the source, ours the target
//! 4. **Acknowledge**: each written batch is reported back via `notifyProgress`
//!
//! # Example
//!
//! ```
//! use docmesh_sync::transport::memory::{MemoryHub, MemoryMesh};
//! use docmesh_sync::PeerHost;
//! use std::sync::Arc;
//!
//! let hub = MemoryHub::new();
//! let mesh = Arc::new(MemoryMesh::new(hub, "notes"));
//! let host = PeerHost::new(mesh, "laptop", "linux", None);
//! assert_eq!(host.name(), "laptop");
//! ```

pub mod acceptance;
pub mod capabilities;
mod error;
mod host;
mod hosted;
pub mod p2p;
pub mod protocol;
pub mod replicator;
pub mod rpc;
mod session;
pub mod settings;
pub mod transport;
pub mod tweaks;

pub use acceptance::{AcceptanceModel, Decision};
pub use capabilities::{Capabilities, Confirm, HeadlessConfirm};
pub use error::{SyncError, SyncResult};
pub use host::{HostEvent, KnownPeer, PeerHost};
pub use hosted::{HostedStore, RemoteDocumentStore};
pub use protocol::{Advertisement, MeshMessage, PROTOCOL_VERSION, RpcDirection, RpcFrame};
pub use replicator::{
    CancelSignal, NoopObserver, ProgressInfo, ReplicationObserver, ReplicationOptions,
    ReplicationSummary, Replicator,
};
pub use rpc::{RpcClient, RpcGate, RpcHandler, RpcServer, handler_fn};
pub use session::{Direction, PeerSession, SessionEvent};
pub use settings::{MemorySettingsSource, ReplicatorSettings, SettingsSource};
pub use transport::{MeshEvent, MeshTransport};
pub use tweaks::{TweakComparison, TweakValues};
