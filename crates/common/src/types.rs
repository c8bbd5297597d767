// Core domain types shared across all Tandem crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::path::{normalize_file_path, PathError};

/// Identifier the transport assigns to one live socket.
pub type ConnectionId = Uuid;

/// Identifier of an authenticated IDE user.
pub type UserId = String;

/// Stable identifier of a collaboratively edited file:
/// `"{workspace_id}:{normalized_file_path}"`, e.g. `ws1:main.py`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(workspace_id, file_path)` at the first `:`.
    pub fn split(&self) -> Option<(&str, &str)> {
        self.0.split_once(':')
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("workspace id is empty")]
    EmptyWorkspace,

    #[error("workspace id `{0}` must not contain `:`")]
    InvalidWorkspace(String),

    #[error("document id `{0}` is not of the form `workspace:path`")]
    MalformedDocumentId(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Full key of a document session: the derived id plus its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub document_id: DocumentId,
    pub workspace_id: String,
    pub file_path: String,
}

impl DocumentKey {
    /// Build a key from a workspace id and a raw file path, normalizing the path.
    pub fn new(workspace_id: &str, file_path: &str) -> Result<Self, KeyError> {
        let workspace_id = workspace_id.trim();
        if workspace_id.is_empty() {
            return Err(KeyError::EmptyWorkspace);
        }
        if workspace_id.contains(':') {
            return Err(KeyError::InvalidWorkspace(workspace_id.to_string()));
        }

        let file_path = normalize_file_path(file_path)?;
        Ok(Self {
            document_id: DocumentId(format!("{workspace_id}:{file_path}")),
            workspace_id: workspace_id.to_string(),
            file_path,
        })
    }

    /// Parse a key back out of a document id.
    pub fn parse(document_id: &DocumentId) -> Result<Self, KeyError> {
        let (workspace_id, file_path) = document_id
            .split()
            .ok_or_else(|| KeyError::MalformedDocumentId(document_id.to_string()))?;
        Self::new(workspace_id, file_path)
    }
}

/// Lifecycle of a resident session as reported by observability reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Resident,
    PendingEviction,
}

/// Point-in-time view of one resident document session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub document_id: DocumentId,
    pub workspace_id: String,
    pub file_path: String,
    pub state: SessionState,
    /// Version of the last successful flush (0 if never persisted).
    pub version: i64,
    pub dirty: bool,
    pub participant_count: usize,
    /// Lowercase hex SHA-256 of the last persisted state.
    pub checksum: Option<String>,
    pub last_modified_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_flushed_at: Option<DateTime<Utc>>,
}

/// A connection attached to a document session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}
