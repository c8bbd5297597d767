// Durable storage seam for document state.

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tandem_common::types::{DocumentId, UserId};
use thiserror::Error;

pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("stored record for {document_id} is malformed: {reason}")]
    Malformed { document_id: DocumentId, reason: String },

    #[error("sqlite operation failed")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store worker task failed")]
    Task(#[from] tokio::task::JoinError),
}

/// Durable counterpart of a document session.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedDocument {
    pub document_id: DocumentId,
    pub workspace_id: String,
    pub file_path: String,
    pub state: Vec<u8>,
    pub version: i64,
    /// Lowercase hex SHA-256 of `state`.
    pub checksum: String,
    pub last_modified_by: Option<UserId>,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Fields the engine supplies on flush. Version and checksum are the store's job.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertDocument {
    pub workspace_id: String,
    pub file_path: String,
    pub state: Vec<u8>,
    pub last_modified_by: Option<UserId>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub version: i64,
    pub checksum: String,
}

/// Adapter over the durable document store.
///
/// `upsert_record` assigns `version = previous + 1` (1 for a new record) and
/// recomputes the checksum from the exact bytes written.
pub trait DocumentStore: Send + Sync {
    fn load_record<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> StoreFuture<'a, Option<PersistedDocument>>;

    fn upsert_record<'a>(
        &'a self,
        document_id: &'a DocumentId,
        record: UpsertDocument,
    ) -> StoreFuture<'a, UpsertOutcome>;

    /// Delete records not modified within `threshold`, except those in
    /// `keep`. Returns the number removed.
    fn delete_if_inactive<'a>(
        &'a self,
        threshold: Duration,
        keep: &'a HashSet<DocumentId>,
    ) -> StoreFuture<'a, u64>;
}

/// Compute the SHA-256 of persisted state, returned as a lowercase hex string.
pub fn checksum(state: &[u8]) -> String {
    let digest = Sha256::digest(state);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Cutoff timestamp for an inactivity sweep.
pub(crate) fn inactive_cutoff(threshold: Duration) -> DateTime<Utc> {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    Utc::now().checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
