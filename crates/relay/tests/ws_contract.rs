use serde_json::{json, Value};
use tandem_common::protocol::ws::{AwarenessPeer, ClientMessage, ServerMessage};
use uuid::Uuid;

const RELAY_WS_SOURCE: &str = include_str!("../src/ws/mod.rs");

#[test]
fn heartbeat_timeout_spans_several_pings() {
    let interval = parse_secs_const(RELAY_WS_SOURCE, "HEARTBEAT_INTERVAL");
    let timeout = parse_secs_const(RELAY_WS_SOURCE, "HEARTBEAT_TIMEOUT");
    assert_eq!(interval, 15);
    assert!(timeout >= 2 * interval, "a single lost pong must not drop the connection");
}

#[test]
fn client_frame_shapes() {
    let samples = [
        (
            ClientMessage::Join { workspace_id: "ws1".into(), file_path: "main.py".into() },
            "join",
            &["type", "workspace_id", "file_path"][..],
        ),
        (
            ClientMessage::Update { document_id: "ws1:main.py".into(), payload_b64: "AAE=".into() },
            "update",
            &["type", "document_id", "payload_b64"][..],
        ),
        (
            ClientMessage::Awareness {
                document_id: "ws1:main.py".into(),
                payload: json!({ "cursor": 4 }),
            },
            "awareness",
            &["type", "document_id", "payload"][..],
        ),
        (
            ClientMessage::Leave { document_id: "ws1:main.py".into() },
            "leave",
            &["type", "document_id"][..],
        ),
    ];

    for (message, expected_type, expected_keys) in samples {
        let value = serde_json::to_value(message).expect("frame should serialize");
        assert_shape(value, expected_type, expected_keys);
    }
}

#[test]
fn server_frame_shapes() {
    let connection_id = Uuid::new_v4();
    let samples = [
        (
            ServerMessage::Sync {
                document_id: "ws1:main.py".into(),
                version: 3,
                payload_b64: "AAE=".into(),
            },
            "sync",
            &["type", "document_id", "version", "payload_b64"][..],
        ),
        (
            ServerMessage::Update { document_id: "ws1:main.py".into(), payload_b64: "AAE=".into() },
            "update",
            &["type", "document_id", "payload_b64"][..],
        ),
        (
            ServerMessage::UserJoined {
                document_id: "ws1:main.py".into(),
                user_id: "alice".into(),
                connection_id,
            },
            "user_joined",
            &["type", "document_id", "user_id", "connection_id"][..],
        ),
        (
            ServerMessage::UserLeft {
                document_id: "ws1:main.py".into(),
                user_id: "alice".into(),
                connection_id,
            },
            "user_left",
            &["type", "document_id", "user_id", "connection_id"][..],
        ),
        (
            ServerMessage::Awareness {
                document_id: "ws1:main.py".into(),
                user_id: "alice".into(),
                payload: json!({}),
            },
            "awareness",
            &["type", "document_id", "user_id", "payload"][..],
        ),
        (
            ServerMessage::AwarenessSnapshot {
                document_id: "ws1:main.py".into(),
                entries: vec![AwarenessPeer {
                    user_id: "bob".into(),
                    payload: json!({ "cursor": 1 }),
                }],
            },
            "awareness_snapshot",
            &["type", "document_id", "entries"][..],
        ),
        (
            ServerMessage::AwarenessRemoved {
                document_id: "ws1:main.py".into(),
                user_id: "bob".into(),
            },
            "awareness_removed",
            &["type", "document_id", "user_id"][..],
        ),
        (
            ServerMessage::Error {
                code: "DOCUMENT_LOAD_FAILED".into(),
                message: "store unavailable".into(),
                retryable: true,
                document_id: Some("ws1:main.py".into()),
            },
            "error",
            &["type", "code", "message", "retryable", "document_id"][..],
        ),
    ];

    for (message, expected_type, expected_keys) in samples {
        let value = serde_json::to_value(message).expect("frame should serialize");
        assert_shape(value, expected_type, expected_keys);
    }
}

fn assert_shape(value: Value, expected_type: &str, expected_keys: &[&str]) {
    let object = value.as_object().expect("frame should be a json object");
    assert_eq!(object.get("type").and_then(Value::as_str), Some(expected_type));

    let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
    keys.sort_unstable();
    let mut expected: Vec<&str> = expected_keys.to_vec();
    expected.sort_unstable();
    assert_eq!(keys, expected, "unexpected keys for `{expected_type}` frame");
}

fn parse_secs_const(source: &str, name: &str) -> u64 {
    let marker = format!("const {name}: Duration = Duration::from_secs(");
    let start =
        source.find(&marker).unwrap_or_else(|| panic!("missing constant {name}")) + marker.len();
    let end = source[start..].find(')').expect("constant should close") + start;
    source[start..end].trim().parse().expect("constant should be an integer")
}
