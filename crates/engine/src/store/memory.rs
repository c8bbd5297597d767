// In-process document store.
//
// Used when no database is configured, and by tests: it can simulate an
// unreachable backend and slow reads, and counts the calls it serves.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tandem_common::types::DocumentId;
use tokio::sync::RwLock;

use super::{
    checksum, inactive_cutoff, DocumentStore, PersistedDocument, StoreError, StoreFuture,
    UpsertDocument, UpsertOutcome,
};

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    records: RwLock<HashMap<DocumentId, PersistedDocument>>,
    unavailable: AtomicBool,
    write_failures: AtomicBool,
    load_latency_ms: AtomicU64,
    loads: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the backend were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make only writes fail; loads keep working.
    pub fn set_write_failures(&self, failing: bool) {
        self.write_failures.store(failing, Ordering::SeqCst);
    }

    /// Delay every load by `latency`.
    pub fn set_load_latency(&self, latency: Duration) {
        self.load_latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `load_record` calls served, failed ones included.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of successful `upsert_record` calls.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Insert a record verbatim, bypassing version and checksum assignment.
    pub async fn insert_raw(&self, record: PersistedDocument) {
        self.records.write().await.insert(record.document_id.clone(), record);
    }

    pub async fn record(&self, document_id: &DocumentId) -> Option<PersistedDocument> {
        self.records.read().await.get(document_id).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn load_record<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> StoreFuture<'a, Option<PersistedDocument>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let latency = self.load_latency_ms.load(Ordering::SeqCst);
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            self.check_available()?;
            Ok(self.records.read().await.get(document_id).cloned())
        })
    }

    fn upsert_record<'a>(
        &'a self,
        document_id: &'a DocumentId,
        record: UpsertDocument,
    ) -> StoreFuture<'a, UpsertOutcome> {
        Box::pin(async move {
            self.check_available()?;
            if self.write_failures.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("memory store rejected write".into()));
            }

            let mut records = self.records.write().await;
            let version =
                records.get(document_id).map(|existing| existing.version).unwrap_or(0) + 1;
            let checksum = checksum(&record.state);
            records.insert(
                document_id.clone(),
                PersistedDocument {
                    document_id: document_id.clone(),
                    workspace_id: record.workspace_id,
                    file_path: record.file_path,
                    state: record.state,
                    version,
                    checksum: checksum.clone(),
                    last_modified_by: record.last_modified_by,
                    metadata: record.metadata,
                    updated_at: Utc::now(),
                },
            );
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(UpsertOutcome { version, checksum })
        })
    }

    fn delete_if_inactive<'a>(
        &'a self,
        threshold: Duration,
        keep: &'a HashSet<DocumentId>,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check_available()?;
            let cutoff = inactive_cutoff(threshold);
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|id, record| record.updated_at >= cutoff || keep.contains(id));
            Ok((before - records.len()) as u64)
        })
    }
}
