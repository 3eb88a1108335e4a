use docmesh_sync::protocol::{methods, Advertisement, MeshMessage, RpcDirection, RpcFrame};
use docmesh_sync::PROTOCOL_VERSION;
use docmesh_types::PeerId;
use serde_json::{Value, json};

// ── RPC frames ──────────────────────────────────────────────────

#[test]
fn request_uses_type_and_direction_fields() {
    let frame = RpcFrame::request(methods::DB_INFO, 7, Value::Null);
    let value = serde_json::to_value(&frame).unwrap();

    assert_eq!(value["type"], "db.info");
    assert_eq!(value["direction"], "REQUEST");
    assert_eq!(value["seq"], 7);
    assert!(value.get("args").is_none());
    assert!(value.get("error").is_none());
}

#[test]
fn response_echoes_method_and_seq() {
    let request = RpcFrame::request(methods::DB_GET, 41, json!({"id": "a"}));
    let response = RpcFrame::response(&request, json!({"ok": true}));

    assert_eq!(response.method, "db.get");
    assert_eq!(response.seq, 41);
    assert_eq!(response.direction, RpcDirection::Response);
    assert_eq!(response.args, Value::Null);

    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["direction"], "RESPONSE");
}

#[test]
fn error_response_carries_kind() {
    let request = RpcFrame::request(methods::DB_PUT, 3, Value::Null);
    let frame = RpcFrame::error(&request, "conflict", "document update conflict");

    let error = frame.error.as_ref().unwrap();
    assert_eq!(error.kind, "conflict");
    assert_eq!(frame.data, Value::Null);
}

#[test]
fn only_bang_methods_bypass_the_gate() {
    assert!(RpcFrame::request(methods::REQUEST_AUTHENTICATION, 1, Value::Null).is_ungated());
    assert!(!RpcFrame::request(methods::GET_TWEAK_VALUES, 1, Value::Null).is_ungated());
    assert!(!RpcFrame::request(methods::DB_CHANGES, 1, Value::Null).is_ungated());
}

// ── Mesh messages ───────────────────────────────────────────────

#[test]
fn messages_are_tagged_by_kind() {
    let ad = MeshMessage::Advertise(Advertisement::new(PeerId::from_string("p1"), "laptop", "linux"));
    let value: Value = serde_json::from_slice(&ad.to_bytes().unwrap()).unwrap();
    assert_eq!(value["kind"], "advertise");
    assert_eq!(value["peerId"], "p1");

    let rpc = MeshMessage::Rpc(RpcFrame::request(methods::NOTIFY_CHANGES, 9, Value::Null));
    let value: Value = serde_json::from_slice(&rpc.to_bytes().unwrap()).unwrap();
    assert_eq!(value["kind"], "rpc");
    assert_eq!(value["type"], "notifyChanges");
}

#[test]
fn decode_round_trips_a_frame() {
    let original = MeshMessage::Rpc(RpcFrame::request(methods::REQUEST_PULL, 12, json!({})));
    let decoded = MeshMessage::from_bytes(&original.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn advertisement_version_defaults_when_missing() {
    let raw = br#"{"kind":"advertise","peerId":"p2","name":"desk","platform":"macos"}"#;
    match MeshMessage::from_bytes(raw).unwrap() {
        MeshMessage::Advertise(ad) => {
            assert_eq!(ad.name, "desk");
            assert_eq!(ad.version, PROTOCOL_VERSION);
        }
        other => panic!("expected advertisement, got {other:?}"),
    }
}

#[test]
fn garbage_is_a_decode_error() {
    assert!(MeshMessage::from_bytes(b"{\"kind\":\"shout\"}").is_err());
    assert!(MeshMessage::from_bytes(b"").is_err());
}
