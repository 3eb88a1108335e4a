//! Wire messages exchanged between peers in a room.
//!
//! Every payload delivered by the mesh is one JSON-encoded [`MeshMessage`]:
//! either a device advertisement or an RPC frame. RPC frames are correlated
//! by `seq`, which the caller picks at random among its unused values.

use docmesh_types::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried in advertisements.
pub const PROTOCOL_VERSION: u32 = 1;

/// RPC method names served by every peer.
pub mod methods {
    pub const DB_INFO: &str = "db.info";
    pub const DB_CHANGES: &str = "db.changes";
    pub const DB_REVS_DIFF: &str = "db.revsDiff";
    pub const DB_BULK_DOCS: &str = "db.bulkDocs";
    pub const DB_BULK_GET: &str = "db.bulkGet";
    pub const DB_PUT: &str = "db.put";
    pub const DB_GET: &str = "db.get";

    /// Authentication handshake. The `!` prefix bypasses the acceptance gate.
    pub const REQUEST_AUTHENTICATION: &str = "!requestAuthentication";
    pub const GET_TWEAK_VALUES: &str = "getTweakValues";
    pub const REQUEST_PULL: &str = "requestPull";
    pub const NOTIFY_PROGRESS: &str = "notifyProgress";
    pub const NOTIFY_CHANGES: &str = "notifyChanges";

    /// Methods with this prefix are served without consulting the gate.
    pub const UNGATED_PREFIX: char = '!';
}

/// Any message exchanged over the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshMessage {
    /// "This is who I am."
    Advertise(Advertisement),
    /// A request or response.
    Rpc(RpcFrame),
}

impl MeshMessage {
    /// Encodes the message for the mesh.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decodes a mesh payload.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// A device advertisement, broadcast on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub peer_id: PeerId,
    /// Human-readable device name. Acceptance decisions are keyed by it.
    pub name: String,
    pub platform: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl Advertisement {
    pub fn new(peer_id: PeerId, name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            platform: platform.into(),
            version: PROTOCOL_VERSION,
        }
    }
}

/// Direction of an RPC frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcDirection {
    Request,
    Response,
}

/// Error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// See [`crate::SyncError::kind`].
    pub kind: String,
    pub message: String,
}

/// One RPC request or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFrame {
    /// Method name.
    #[serde(rename = "type")]
    pub method: String,
    pub direction: RpcDirection,
    pub seq: u32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcFrame {
    /// A request frame.
    pub fn request(method: impl Into<String>, seq: u32, args: Value) -> Self {
        Self {
            method: method.into(),
            direction: RpcDirection::Request,
            seq,
            args,
            data: Value::Null,
            error: None,
        }
    }

    /// A successful response to `request`.
    pub fn response(request: &RpcFrame, data: Value) -> Self {
        Self {
            method: request.method.clone(),
            direction: RpcDirection::Response,
            seq: request.seq,
            args: Value::Null,
            data,
            error: None,
        }
    }

    /// A failed response to `request`.
    pub fn error(request: &RpcFrame, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            method: request.method.clone(),
            direction: RpcDirection::Response,
            seq: request.seq,
            args: Value::Null,
            data: Value::Null,
            error: Some(RpcErrorBody {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }

    /// Whether the method bypasses the acceptance gate.
    #[must_use]
    pub fn is_ungated(&self) -> bool {
        self.method.starts_with(methods::UNGATED_PREFIX)
    }
}
