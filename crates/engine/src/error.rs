// Error taxonomy for the collaboration engine.
//
// Load errors are surfaced to the joining client; flush errors are logged and
// retried; relay errors are isolated to one connection.

use std::sync::Arc;
use std::time::Duration;

use tandem_common::types::{ConnectionId, DocumentId, KeyError};
use thiserror::Error;

use crate::crdt::CrdtError;
use crate::store::StoreError;

/// Acquire failed; the session was not registered and a later acquire retries.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to load document {document_id} from the store")]
    Store {
        document_id: DocumentId,
        #[source]
        source: StoreError,
    },

    #[error("persisted state of document {document_id} cannot be decoded")]
    Corrupt {
        document_id: DocumentId,
        #[source]
        source: CrdtError,
    },

    #[error("persisted state of document {document_id} does not match checksum {expected}")]
    ChecksumMismatch { document_id: DocumentId, expected: String, actual: String },

    #[error("loading document {document_id} timed out after {timeout:?}")]
    Timeout { document_id: DocumentId, timeout: Duration },
    /// The load another caller was running for the same document failed.
    #[error(transparent)]
    Shared(Arc<LoadError>),
}

/// A write to the durable store did not happen; the session stays dirty.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("failed to persist document {document_id} at version {version}")]
    Store {
        document_id: DocumentId,
        version: i64,
        #[source]
        source: StoreError,
    },

    #[error("document {0} is not resident")]
    NotResident(DocumentId),
}

/// Delivery to a single connection failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("connection {0} is not registered with the transport")]
    UnknownConnection(ConnectionId),
}

/// An update could not be applied to a resident session.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("document {0} is not resident")]
    NotResident(DocumentId),

    #[error("connection {connection_id} has not joined document {document_id}")]
    NotParticipant { document_id: DocumentId, connection_id: ConnectionId },

    #[error("update for document {document_id} was rejected")]
    InvalidUpdate {
        document_id: DocumentId,
        #[source]
        source: CrdtError,
    },
}

/// Errors reported to a connection by the transport-facing engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection {0} is not open")]
    UnknownConnection(ConnectionId),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("invalid document key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("update payload is not valid base64")]
    InvalidPayload,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl EngineError {
    /// Stable code sent to clients in `error` frames.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownConnection(_) => "CONNECTION_UNKNOWN",
            Self::ShuttingDown => "ENGINE_SHUTTING_DOWN",
            Self::InvalidKey(_) => "INVALID_DOCUMENT_KEY",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::Load(_) => "DOCUMENT_LOAD_FAILED",
            Self::Apply(ApplyError::NotResident(_)) => "DOCUMENT_NOT_RESIDENT",
            Self::Apply(ApplyError::NotParticipant { .. }) => "NOT_JOINED",
            Self::Apply(ApplyError::InvalidUpdate { .. }) => "INVALID_UPDATE",
        }
    }

    /// Whether the client should retry the same request.
    pub const fn retryable(&self) -> bool {
        matches!(self, Self::Load(_) | Self::ShuttingDown | Self::Apply(ApplyError::NotResident(_)))
    }
}
