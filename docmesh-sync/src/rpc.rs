//! Request/response correlation over the mesh.
//!
//! [`RpcClient`] sends requests to one peer and matches responses by `seq`.
//! [`RpcServer`] dispatches inbound requests to registered handlers, asking
//! an optional [`RpcGate`] first unless the method name starts with `!`.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{MeshMessage, RpcFrame};
use crate::transport::MeshTransport;
use async_trait::async_trait;
use docmesh_types::PeerId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Pending = HashMap<u32, oneshot::Sender<SyncResult<Value>>>;

/// Outbound RPC channel to one peer.
pub struct RpcClient {
    peer: PeerId,
    transport: Arc<dyn MeshTransport>,
    pending: Mutex<Pending>,
    closed: AtomicBool,
    default_timeout: Option<Duration>,
}

impl RpcClient {
    /// Creates a client. `default_timeout` applies to calls that pass `None`.
    pub fn new(
        peer: PeerId,
        transport: Arc<dyn MeshTransport>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            peer,
            transport,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            default_timeout,
        }
    }

    /// The remote peer.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (u32, oneshot::Receiver<SyncResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock_pending();
        let seq = loop {
            let candidate: u32 = rand::random();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(seq, tx);
        (seq, rx)
    }

    fn forget(&self, seq: u32) {
        self.lock_pending().remove(&seq);
    }

    /// Calls `method` and waits for its result.
    ///
    /// `timeout` overrides the client's default; with neither set, the call
    /// waits until a response arrives or the client is closed.
    pub async fn call(
        &self,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> SyncResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelClosed);
        }

        let (seq, rx) = self.register();
        let message = MeshMessage::Rpc(RpcFrame::request(method, seq, args));
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.forget(seq);
                return Err(e.into());
            }
        };
        if let Err(e) = self.transport.send(&self.peer, bytes).await {
            self.forget(seq);
            return Err(e);
        }
        debug!(peer = %self.peer, method, seq, "rpc request sent");

        let outcome = match timeout.or(self.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.forget(seq);
                    debug!(peer = %self.peer, method, seq, "rpc request timed out");
                    return Err(SyncError::Timeout);
                }
            },
            None => rx.await,
        };
        outcome.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Typed wrapper around [`call`](Self::call).
    pub async fn call_typed<A, R>(
        &self,
        method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> SyncResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call(method, serde_json::to_value(args)?, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Resolves the pending call matching a response frame.
    pub fn handle_response(&self, frame: RpcFrame) {
        let Some(tx) = self.lock_pending().remove(&frame.seq) else {
            debug!(
                peer = %self.peer,
                method = %frame.method,
                seq = frame.seq,
                "dropping unmatched rpc response"
            );
            return;
        };
        let result = match frame.error {
            Some(err) => Err(SyncError::Remote {
                kind: err.kind,
                message: err.message,
            }),
            None => Ok(frame.data),
        };
        let _ = tx.send(result);
    }

    /// Rejects every pending call and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.lock_pending().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(SyncError::ChannelClosed));
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Handler for one served method.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, peer: &PeerId, args: Value) -> SyncResult<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(PeerId, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
{
    async fn handle(&self, peer: &PeerId, args: Value) -> SyncResult<Value> {
        (self.0)(peer.clone(), args).await
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(PeerId, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Decides whether a peer may call gated methods.
#[async_trait]
pub trait RpcGate: Send + Sync {
    async fn admit(&self, peer: &PeerId) -> bool;
}

/// Inbound method table.
#[derive(Default)]
pub struct RpcServer {
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    gate: RwLock<Option<Arc<dyn RpcGate>>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a handler.
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.into(), handler);
    }

    /// Removes a handler.
    pub fn unregister(&self, method: &str) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method);
    }

    /// Whether a handler is registered for `method`.
    pub fn serves(&self, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(method)
    }

    /// Installs the acceptance gate.
    pub fn set_gate(&self, gate: Arc<dyn RpcGate>) {
        *self.gate.write().unwrap_or_else(PoisonError::into_inner) = Some(gate);
    }

    /// Handles a request frame. Returns the response to send, or `None`
    /// when no response must be sent.
    pub async fn dispatch(&self, peer: &PeerId, request: RpcFrame) -> Option<RpcFrame> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.method)
            .cloned();
        let Some(handler) = handler else {
            warn!(%peer, method = %request.method, "unknown rpc method");
            return Some(RpcFrame::error(
                &request,
                "unknown_method",
                format!("unknown method: {}", request.method),
            ));
        };

        if !request.is_ungated() {
            let gate = self
                .gate
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(gate) = gate {
                if !gate.admit(peer).await {
                    debug!(%peer, method = %request.method, "request from unaccepted peer ignored");
                    return None;
                }
            }
        }

        match handler.handle(peer, request.args.clone()).await {
            Ok(data) => Some(RpcFrame::response(&request, data)),
            Err(SyncError::ResponsePrevented) => None,
            Err(e) => {
                debug!(%peer, method = %request.method, "rpc handler failed: {e}");
                Some(RpcFrame::error(&request, e.kind(), e.to_string()))
            }
        }
    }
}
