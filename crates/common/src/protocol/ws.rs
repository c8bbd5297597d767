// WebSocket message types for the tandem-collab.v1 protocol.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, DocumentId, UserId};

/// Frames a client sends to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach to a file's session, loading it if needed.
    Join { workspace_id: String, file_path: String },

    /// A binary CRDT update produced by the client's replica.
    Update { document_id: DocumentId, payload_b64: String },

    /// Opaque presence payload (cursor, selection, display name).
    Awareness { document_id: DocumentId, payload: serde_json::Value },

    /// Detach from a session.
    Leave { document_id: DocumentId },
}

/// Frames the engine sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full encoded state for a (re)joining connection.
    Sync { document_id: DocumentId, version: i64, payload_b64: String },

    /// Another participant's update, relayed unchanged.
    Update { document_id: DocumentId, payload_b64: String },

    UserJoined { document_id: DocumentId, user_id: UserId, connection_id: ConnectionId },

    UserLeft { document_id: DocumentId, user_id: UserId, connection_id: ConnectionId },

    Awareness { document_id: DocumentId, user_id: UserId, payload: serde_json::Value },

    /// Presence of every current participant, sent to new joiners.
    AwarenessSnapshot { document_id: DocumentId, entries: Vec<AwarenessPeer> },

    /// A user's presence expired or was cleared.
    AwarenessRemoved { document_id: DocumentId, user_id: UserId },

    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        document_id: Option<DocumentId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwarenessPeer {
    pub user_id: UserId,
    pub payload: serde_json::Value,
}

impl ServerMessage {
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            Self::Sync { document_id, .. }
            | Self::Update { document_id, .. }
            | Self::UserJoined { document_id, .. }
            | Self::UserLeft { document_id, .. }
            | Self::Awareness { document_id, .. }
            | Self::AwarenessSnapshot { document_id, .. }
            | Self::AwarenessRemoved { document_id, .. } => Some(document_id),
            Self::Error { document_id, .. } => document_id.as_ref(),
        }
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(payload_b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(payload_b64)
}

pub fn decode_client_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
