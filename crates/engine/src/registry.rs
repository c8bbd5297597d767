// Document registry: owns every resident session.
//
// Lock order is always registry map before session. Store I/O never runs
// with a session lock held, and only the retention sweep holds the map lock
// across it. Loads are tracked by a `Loading` slot so concurrent acquires of
// the same document share one store read and its result.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_common::types::{
    ConnectionId, DocumentId, DocumentKey, DocumentStats, ParticipantInfo, UserId,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::crdt::{CrdtState, YrsDocument};
use crate::error::{ApplyError, FlushError, LoadError};
use crate::session::{DocumentSession, FlushSnapshot, Lifecycle};
use crate::store::{checksum, DocumentStore, StoreError, UpsertDocument};

struct SessionInner<C> {
    document_id: DocumentId,
    session: Mutex<DocumentSession<C>>,
    /// Held for the whole of a flush so writes of one document never overlap.
    flush_lock: Mutex<()>,
}

/// Shared reference to a resident session.
pub struct SessionHandle<C = YrsDocument> {
    inner: Arc<SessionInner<C>>,
}

impl<C> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: CrdtState> SessionHandle<C> {
    fn new(session: DocumentSession<C>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                document_id: session.key.document_id.clone(),
                session: Mutex::new(session),
                flush_lock: Mutex::new(()),
            }),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.inner.document_id
    }

    pub async fn stats(&self) -> DocumentStats {
        self.inner.session.lock().await.stats()
    }

    /// Full encoded state of the document.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.inner.session.lock().await.encode_state()
    }

    fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Published once by the caller that ran the load; `None` until then.
type LoadOutcome<C> = Option<Result<SessionHandle<C>, Arc<LoadError>>>;

enum Slot<C> {
    Loading { token: u64, done: watch::Receiver<LoadOutcome<C>> },
    Ready(SessionHandle<C>),
}

/// Result of joining a connection to a document.
pub struct Attached<C = YrsDocument> {
    pub handle: SessionHandle<C>,
    /// Full state to send to the joiner.
    pub snapshot: Vec<u8>,
    pub version: i64,
    /// Other connections already on the document.
    pub peers: Vec<ConnectionId>,
    /// False when the connection was already attached.
    pub newly_joined: bool,
    /// The join cancelled a pending eviction.
    pub eviction_cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub user_id: UserId,
    /// Connections still on the document.
    pub remaining: Vec<ConnectionId>,
    /// The user still has another connection on the document.
    pub user_still_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Clean,
    Flushed { version: i64 },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: Vec<(DocumentId, i64)>,
    pub failed: Vec<DocumentId>,
}

pub struct DocumentRegistry<C = YrsDocument> {
    sessions: RwLock<HashMap<DocumentId, Slot<C>>>,
    store: Arc<dyn DocumentStore>,
    load_timeout: Duration,
    idle_grace: Duration,
    next_load_token: AtomicU64,
}

enum Lookup<C> {
    Ready(SessionHandle<C>),
    Wait(watch::Receiver<LoadOutcome<C>>),
}

impl<C: CrdtState> DocumentRegistry<C> {
    pub fn new(store: Arc<dyn DocumentStore>, config: &EngineConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            load_timeout: config.load_timeout,
            idle_grace: config.idle_grace,
            next_load_token: AtomicU64::new(1),
        }
    }

    /// Return the resident session for `key`, loading it from the store if
    /// needed. Callers arriving during a load get that load's result. A failed
    /// load leaves nothing registered.
    pub async fn acquire(&self, key: &DocumentKey) -> Result<SessionHandle<C>, LoadError> {
        let document_id = &key.document_id;
        loop {
            let (token, done_tx) = {
                let mut sessions = self.sessions.write().await;
                let lookup = match sessions.get(document_id) {
                    Some(Slot::Ready(handle)) => Some(Lookup::Ready(handle.clone())),
                    // A closed channel with the slot still loading means the
                    // loading caller went away; take the load over.
                    Some(Slot::Loading { done, .. }) if done.has_changed().is_ok() => {
                        Some(Lookup::Wait(done.clone()))
                    }
                    _ => None,
                };

                match lookup {
                    Some(Lookup::Ready(handle)) => return Ok(handle),
                    Some(Lookup::Wait(mut done)) => {
                        drop(sessions);
                        let outcome = done
                            .wait_for(Option::is_some)
                            .await
                            .ok()
                            .and_then(|published| (*published).clone());
                        match outcome {
                            Some(Ok(handle)) => return Ok(handle),
                            Some(Err(error)) => return Err(LoadError::Shared(error)),
                            // Dropped without publishing; take the load over.
                            None => continue,
                        }
                    }
                    None => {
                        let token = self.next_load_token.fetch_add(1, Ordering::Relaxed);
                        let (done_tx, done) = watch::channel(None);
                        sessions.insert(document_id.clone(), Slot::Loading { token, done });
                        (token, done_tx)
                    }
                }
            };

            let loaded = self.load(key).await;

            let mut sessions = self.sessions.write().await;
            let owns_slot = matches!(
                sessions.get(document_id),
                Some(Slot::Loading { token: current, .. }) if *current == token
            );
            return match loaded {
                Ok(session) => {
                    let handle = SessionHandle::new(session);
                    if owns_slot {
                        sessions.insert(document_id.clone(), Slot::Ready(handle.clone()));
                    }
                    done_tx.send_replace(Some(Ok(handle.clone())));
                    Ok(handle)
                }
                Err(error) => {
                    if owns_slot {
                        sessions.remove(document_id);
                    }
                    warn!(document_id = %document_id, error = %error, "document load failed");
                    let error = Arc::new(error);
                    done_tx.send_replace(Some(Err(Arc::clone(&error))));
                    drop(done_tx);
                    drop(sessions);
                    // Unwraps unless a waiter still holds the published copy.
                    Err(Arc::try_unwrap(error).unwrap_or_else(LoadError::Shared))
                }
            };
        }
    }

    async fn load(&self, key: &DocumentKey) -> Result<DocumentSession<C>, LoadError> {
        let document_id = &key.document_id;
        let record = tokio::time::timeout(self.load_timeout, self.store.load_record(document_id))
            .await
            .map_err(|_| LoadError::Timeout {
                document_id: document_id.clone(),
                timeout: self.load_timeout,
            })?
            .map_err(|source| LoadError::Store { document_id: document_id.clone(), source })?;

        let Some(record) = record else {
            debug!(document_id = %document_id, "no persisted state, starting empty document");
            return Ok(DocumentSession::new_empty(key.clone()));
        };

        let actual = checksum(&record.state);
        if actual != record.checksum {
            return Err(LoadError::ChecksumMismatch {
                document_id: document_id.clone(),
                expected: record.checksum,
                actual,
            });
        }

        let version = record.version;
        let session = DocumentSession::from_record(key.clone(), record)
            .map_err(|source| LoadError::Corrupt { document_id: document_id.clone(), source })?;
        info!(document_id = %document_id, version, "loaded document from store");
        Ok(session)
    }

    /// Join `connection_id` to the document, loading it if needed.
    pub async fn attach(
        &self,
        key: &DocumentKey,
        connection_id: ConnectionId,
        user_id: &str,
    ) -> Result<Attached<C>, LoadError> {
        loop {
            let handle = self.acquire(key).await?;
            let mut session = handle.inner.session.lock().await;
            if session.is_evicted() {
                continue;
            }

            let (newly_joined, eviction_cancelled) =
                session.add_participant(connection_id, user_id);
            if eviction_cancelled {
                debug!(
                    document_id = %key.document_id,
                    connection_id = %connection_id,
                    "eviction conflict resolved, session kept resident"
                );
            }
            let snapshot = session.encode_state();
            let version = session.version;
            let peers = session.other_connections(Some(connection_id));
            drop(session);

            return Ok(Attached {
                handle,
                snapshot,
                version,
                peers,
                newly_joined,
                eviction_cancelled,
            });
        }
    }

    /// Detach a connection. `None` when it was not attached.
    pub async fn release(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
    ) -> Option<Released> {
        let handle = self.resident(document_id).await?;
        let mut session = handle.inner.session.lock().await;
        let participant = session.remove_participant(connection_id)?;
        Some(Released {
            user_still_present: session.has_user(&participant.user_id),
            remaining: session.other_connections(None),
            user_id: participant.user_id,
        })
    }

    /// Merge an update from an attached connection. Returns the connections
    /// the update must be relayed to.
    pub async fn apply_update(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
        update: &[u8],
    ) -> Result<Vec<ConnectionId>, ApplyError> {
        let handle = self
            .resident(document_id)
            .await
            .ok_or_else(|| ApplyError::NotResident(document_id.clone()))?;
        let mut session = handle.inner.session.lock().await;
        if session.is_evicted() {
            return Err(ApplyError::NotResident(document_id.clone()));
        }
        if !session.participants.contains_key(&connection_id) {
            return Err(ApplyError::NotParticipant {
                document_id: document_id.clone(),
                connection_id,
            });
        }

        session.apply_update(connection_id, update).map_err(|source| {
            ApplyError::InvalidUpdate { document_id: document_id.clone(), source }
        })?;
        Ok(session.other_connections(Some(connection_id)))
    }

    /// Connections attached to a document, minus `exclude`.
    pub async fn recipients(
        &self,
        document_id: &DocumentId,
        exclude: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        match self.resident(document_id).await {
            Some(handle) => handle.inner.session.lock().await.other_connections(exclude),
            None => Vec::new(),
        }
    }

    /// Refresh a participant's last-seen time. Returns whether the connection
    /// is attached to the document.
    pub async fn touch_participant(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
    ) -> bool {
        let Some(handle) = self.resident(document_id).await else {
            return false;
        };
        let mut session = handle.inner.session.lock().await;
        if !session.participants.contains_key(&connection_id) {
            return false;
        }
        session.touch_participant(connection_id);
        true
    }

    /// Whether any connection of `user_id` is attached to the document.
    pub async fn has_user(&self, document_id: &DocumentId, user_id: &str) -> bool {
        match self.resident(document_id).await {
            Some(handle) => handle.inner.session.lock().await.has_user(user_id),
            None => false,
        }
    }

    pub async fn flush(&self, document_id: &DocumentId) -> Result<FlushOutcome, FlushError> {
        let handle = self
            .resident(document_id)
            .await
            .ok_or_else(|| FlushError::NotResident(document_id.clone()))?;
        self.flush_handle(&handle).await
    }

    async fn flush_handle(&self, handle: &SessionHandle<C>) -> Result<FlushOutcome, FlushError> {
        let _flushing = handle.inner.flush_lock.lock().await;

        let (key, snapshot) = {
            let session = handle.inner.session.lock().await;
            if !session.dirty {
                return Ok(FlushOutcome::Clean);
            }
            (session.key.clone(), session.flush_snapshot())
        };

        let FlushSnapshot { state, edit_seq, version, last_modified_by, metadata } = snapshot;
        let record = UpsertDocument {
            workspace_id: key.workspace_id,
            file_path: key.file_path,
            state,
            last_modified_by,
            metadata,
        };
        let outcome = self.store.upsert_record(&key.document_id, record).await.map_err(|source| {
            FlushError::Store { document_id: key.document_id.clone(), version: version + 1, source }
        })?;

        let mut session = handle.inner.session.lock().await;
        session.complete_flush(edit_seq, outcome.version, outcome.checksum);
        debug!(document_id = %key.document_id, version = session.version, "flushed document");
        Ok(FlushOutcome::Flushed { version: session.version })
    }

    /// Flush every dirty session once. Failures are logged and left dirty.
    pub async fn flush_dirty(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for handle in self.ready_handles().await {
            match self.flush_handle(&handle).await {
                Ok(FlushOutcome::Flushed { version }) => {
                    report.flushed.push((handle.document_id().clone(), version));
                }
                Ok(FlushOutcome::Clean) => {}
                Err(error) => {
                    warn!(
                        document_id = %handle.document_id(),
                        error = %error,
                        "flush failed, document stays dirty"
                    );
                    report.failed.push(handle.document_id().clone());
                }
            }
        }
        report
    }

    /// Flush and drop sessions that have had no participants for the idle
    /// grace period. A session whose final flush fails stays resident.
    pub async fn evict_idle(&self) -> Vec<DocumentId> {
        let now = Instant::now();
        let mut candidates = Vec::new();
        for handle in self.ready_handles().await {
            if handle.inner.session.lock().await.is_idle(now, self.idle_grace) {
                candidates.push(handle);
            }
        }

        let mut evicted = Vec::new();
        for handle in candidates {
            let document_id = handle.document_id().clone();
            if let Err(error) = self.flush_handle(&handle).await {
                warn!(
                    document_id = %document_id,
                    error = %error,
                    "final flush failed, keeping document resident"
                );
                continue;
            }

            let mut sessions = self.sessions.write().await;
            let mut session = handle.inner.session.lock().await;
            if session.dirty || !session.is_idle(Instant::now(), self.idle_grace) {
                debug!(
                    document_id = %document_id,
                    "eviction conflict resolved, session kept resident"
                );
                continue;
            }
            session.lifecycle = Lifecycle::Evicted;
            let registered = matches!(
                sessions.get(&document_id),
                Some(Slot::Ready(current)) if current.same_session(&handle)
            );
            if registered {
                sessions.remove(&document_id);
            }
            info!(document_id = %document_id, version = session.version, "evicted idle document");
            evicted.push(document_id);
        }
        evicted
    }

    /// Delete persisted records untouched for `retention`, skipping every
    /// document that is resident or loading. The map stays read-locked for the
    /// sweep so no document becomes resident while its record is removed.
    pub async fn sweep_inactive_records(&self, retention: Duration) -> Result<u64, StoreError> {
        let sessions = self.sessions.read().await;
        let keep: HashSet<DocumentId> = sessions.keys().cloned().collect();
        let deleted = self.store.delete_if_inactive(retention, &keep).await?;
        drop(sessions);
        Ok(deleted)
    }

    /// Flush every resident session within `budget`. Returns the documents
    /// whose latest state may not have been persisted.
    pub async fn shutdown(&self, budget: Duration) -> Vec<DocumentId> {
        let handles = self.ready_handles().await;
        let mut failed = Vec::new();
        let mut attempted = 0;

        let finished = tokio::time::timeout(budget, async {
            for handle in &handles {
                if let Err(error) = self.flush_handle(handle).await {
                    warn!(
                        document_id = %handle.document_id(),
                        error = %error,
                        "flush during shutdown failed"
                    );
                    failed.push(handle.document_id().clone());
                }
                attempted += 1;
            }
        })
        .await;

        let mut unflushed = failed;
        if finished.is_err() {
            for handle in &handles[attempted..] {
                if handle.inner.session.lock().await.dirty {
                    unflushed.push(handle.document_id().clone());
                }
            }
        }

        if unflushed.is_empty() {
            info!(documents = handles.len(), "all documents flushed before shutdown");
        } else {
            warn!(unflushed = ?unflushed, "shutdown finished with unflushed documents");
        }
        unflushed
    }

    pub async fn is_resident(&self, document_id: &DocumentId) -> bool {
        self.resident(document_id).await.is_some()
    }

    pub async fn resident_count(&self) -> usize {
        self.ready_handles().await.len()
    }

    pub async fn stats(&self, document_id: &DocumentId) -> Option<DocumentStats> {
        Some(self.resident(document_id).await?.stats().await)
    }

    /// Stats of every resident document, ordered by id.
    pub async fn list_all(&self) -> Vec<DocumentStats> {
        let mut all = Vec::new();
        for handle in self.ready_handles().await {
            all.push(handle.stats().await);
        }
        all.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        all
    }

    pub async fn participants(&self, document_id: &DocumentId) -> Option<Vec<ParticipantInfo>> {
        let handle = self.resident(document_id).await?;
        let session = handle.inner.session.lock().await;
        Some(session.participant_infos())
    }

    async fn resident(&self, document_id: &DocumentId) -> Option<SessionHandle<C>> {
        match self.sessions.read().await.get(document_id) {
            Some(Slot::Ready(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    async fn ready_handles(&self) -> Vec<SessionHandle<C>> {
        self.sessions
            .read()
            .await
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(handle) => Some(handle.clone()),
                Slot::Loading { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDocumentStore, PersistedDocument};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn config() -> EngineConfig {
        EngineConfig {
            idle_grace: Duration::from_secs(60),
            load_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    fn registry(store: &Arc<MemoryDocumentStore>) -> DocumentRegistry {
        DocumentRegistry::new(store.clone(), &config())
    }

    fn key() -> DocumentKey {
        DocumentKey::new("ws1", "main.py").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_a_single_load() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_load_latency(Duration::from_millis(200));
        let registry = registry(&store);
        let key = key();

        let (a, b, c) =
            tokio::join!(registry.acquire(&key), registry.acquire(&key), registry.acquire(&key));
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(store.load_count(), 1);
        assert!(a.same_session(&b) && b.same_session(&c));
        assert_eq!(registry.resident_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_a_failed_load() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_unavailable(true);
        store.set_load_latency(Duration::from_millis(200));
        let registry = registry(&store);
        let key = key();
        let started = Instant::now();

        let (a, b, c) =
            tokio::join!(registry.acquire(&key), registry.acquire(&key), registry.acquire(&key));

        assert_eq!(store.load_count(), 1);
        for result in [a, b, c] {
            let error = result.err().expect("every caller should see the failure");
            assert!(error.to_string().contains("failed to load document ws1:main.py"));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!registry.is_resident(&key.document_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_load_is_taken_over_by_the_next_caller() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_load_latency(Duration::from_millis(200));
        let registry = registry(&store);
        let key = key();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), registry.acquire(&key));
        assert!(abandoned.await.is_err());

        registry.acquire(&key).await.expect("takeover should load");
        assert_eq!(store.load_count(), 2);
        assert!(registry.is_resident(&key.document_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_registers_nothing_and_later_acquire_retries() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_unavailable(true);
        let registry = registry(&store);

        let error = registry.acquire(&key()).await.err().expect("load should fail");
        assert!(matches!(error, LoadError::Store { .. }));
        assert!(!registry.is_resident(&key().document_id).await);

        store.set_unavailable(false);
        registry.acquire(&key()).await.expect("retry should load");
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_load_latency(Duration::from_secs(30));
        let registry = registry(&store);

        let error = registry.acquire(&key()).await.err().expect("load should time out");
        assert!(matches!(
            error,
            LoadError::Timeout { timeout, .. } if timeout == Duration::from_secs(5)
        ));
        assert!(!registry.is_resident(&key().document_id).await);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_a_load_failure() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .insert_raw(PersistedDocument {
                document_id: key().document_id,
                workspace_id: "ws1".into(),
                file_path: "main.py".into(),
                state: YrsDocument::default().encode_state(),
                version: 3,
                checksum: "0".repeat(64),
                last_modified_by: None,
                metadata: json!({}),
                updated_at: Utc::now(),
            })
            .await;
        let registry = registry(&store);

        let error = registry.acquire(&key()).await.err().expect("load should fail");
        assert!(matches!(error, LoadError::ChecksumMismatch { .. }));
        assert_eq!(registry.resident_count().await, 0);
    }

    #[tokio::test]
    async fn undecodable_state_is_corrupt() {
        let store = Arc::new(MemoryDocumentStore::new());
        let garbage = b"not a crdt update".to_vec();
        store
            .insert_raw(PersistedDocument {
                document_id: key().document_id,
                workspace_id: "ws1".into(),
                file_path: "main.py".into(),
                checksum: checksum(&garbage),
                state: garbage,
                version: 1,
                last_modified_by: None,
                metadata: json!({}),
                updated_at: Utc::now(),
            })
            .await;
        let registry = registry(&store);

        let error = registry.acquire(&key()).await.err().expect("load should fail");
        assert!(matches!(error, LoadError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn burst_of_updates_flushes_once() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let conn = Uuid::new_v4();
        registry.attach(&key, conn, "alice").await.unwrap();

        let author = YrsDocument::with_client_id(11);
        for i in 0..5 {
            let update = author.insert_text("content", i, "x");
            registry.apply_update(&key.document_id, conn, &update).await.unwrap();
        }

        let report = registry.flush_dirty().await;
        assert_eq!(report.flushed, vec![(key.document_id.clone(), 1)]);
        assert_eq!(store.upsert_count(), 1);

        let stats = registry.stats(&key.document_id).await.unwrap();
        assert!(!stats.dirty);
        assert_eq!(stats.version, 1);
        assert_eq!(stats.last_modified_by.as_deref(), Some("alice"));

        let record = store.record(&key.document_id).await.unwrap();
        assert_eq!(stats.checksum, Some(record.checksum));
        assert_eq!(registry.flush(&key.document_id).await.unwrap(), FlushOutcome::Clean);
    }

    #[tokio::test]
    async fn failed_flush_keeps_session_dirty() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let conn = Uuid::new_v4();
        registry.attach(&key, conn, "alice").await.unwrap();
        let update = YrsDocument::with_client_id(3).insert_text("content", 0, "hi");
        registry.apply_update(&key.document_id, conn, &update).await.unwrap();

        store.set_write_failures(true);
        let report = registry.flush_dirty().await;
        assert_eq!(report.failed, vec![key.document_id.clone()]);
        let stats = registry.stats(&key.document_id).await.unwrap();
        assert!(stats.dirty);
        assert_eq!(stats.version, 0);

        store.set_write_failures(false);
        assert_eq!(
            registry.flush(&key.document_id).await.unwrap(),
            FlushOutcome::Flushed { version: 1 }
        );
    }

    #[tokio::test]
    async fn updates_require_attachment_and_valid_bytes() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let update = YrsDocument::with_client_id(3).insert_text("content", 0, "hi");

        let missing = registry.apply_update(&key.document_id, Uuid::new_v4(), &update).await;
        assert!(matches!(missing, Err(ApplyError::NotResident(_))));

        let conn = Uuid::new_v4();
        registry.attach(&key, conn, "alice").await.unwrap();
        let stranger = registry.apply_update(&key.document_id, Uuid::new_v4(), &update).await;
        assert!(matches!(stranger, Err(ApplyError::NotParticipant { .. })));

        let invalid = registry.apply_update(&key.document_id, conn, b"\xff\xff\xff").await;
        assert!(matches!(invalid, Err(ApplyError::InvalidUpdate { .. })));
        assert!(!registry.stats(&key.document_id).await.unwrap().dirty);
    }

    #[tokio::test]
    async fn recipients_exclude_the_sender() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.attach(&key, a, "alice").await.unwrap();
        let attached = registry.attach(&key, b, "bob").await.unwrap();
        assert_eq!(attached.peers, vec![a]);

        let update = YrsDocument::with_client_id(5).insert_text("content", 0, "x");
        assert_eq!(registry.apply_update(&key.document_id, b, &update).await.unwrap(), vec![a]);
        assert_eq!(registry.recipients(&key.document_id, Some(a)).await, vec![b]);
    }

    #[tokio::test]
    async fn same_user_on_two_connections_counts_twice() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.attach(&key, a, "alice").await.unwrap();
        registry.attach(&key, b, "alice").await.unwrap();
        assert_eq!(registry.participants(&key.document_id).await.unwrap().len(), 2);

        let released = registry.release(&key.document_id, a).await.unwrap();
        assert!(released.user_still_present);
        assert_eq!(released.remaining, vec![b]);
        assert!(registry.release(&key.document_id, a).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_keeps_session_without_reload() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let conn = Uuid::new_v4();
        registry.attach(&key, conn, "alice").await.unwrap();
        registry.release(&key.document_id, conn).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(registry.evict_idle().await.is_empty());

        let rejoined = registry.attach(&key, conn, "alice").await.unwrap();
        assert!(rejoined.eviction_cancelled);
        assert_eq!(store.load_count(), 1);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(registry.evict_idle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_flushed_then_evicted() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let conn = Uuid::new_v4();
        registry.attach(&key, conn, "alice").await.unwrap();
        let update = YrsDocument::with_client_id(9).insert_text("content", 0, "bye");
        registry.apply_update(&key.document_id, conn, &update).await.unwrap();
        registry.release(&key.document_id, conn).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.evict_idle().await, vec![key.document_id.clone()]);
        assert!(!registry.is_resident(&key.document_id).await);
        assert_eq!(store.record(&key.document_id).await.unwrap().version, 1);

        let reloaded = registry.attach(&key, conn, "alice").await.unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_sweep_spares_resident_documents() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let conn = Uuid::new_v4();
        registry.attach(&key, conn, "alice").await.unwrap();
        let update = YrsDocument::with_client_id(9).insert_text("content", 0, "kept");
        registry.apply_update(&key.document_id, conn, &update).await.unwrap();
        let flushed = registry.flush(&key.document_id).await.unwrap();
        assert_eq!(flushed, FlushOutcome::Flushed { version: 1 });

        let stale = DocumentId::from("ws1:stale.py");
        store
            .insert_raw(PersistedDocument {
                document_id: stale.clone(),
                workspace_id: "ws1".into(),
                file_path: "stale.py".into(),
                state: YrsDocument::default().encode_state(),
                version: 1,
                checksum: checksum(&YrsDocument::default().encode_state()),
                last_modified_by: None,
                metadata: json!({}),
                updated_at: Utc::now() - chrono::Duration::days(90),
            })
            .await;

        assert_eq!(registry.sweep_inactive_records(Duration::ZERO).await.unwrap(), 1);
        assert!(store.record(&stale).await.is_none());
        assert_eq!(store.record(&key.document_id).await.unwrap().version, 1);

        registry.release(&key.document_id, conn).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.evict_idle().await, vec![key.document_id.clone()]);

        let reloaded = registry.attach(&key, conn, "alice").await.unwrap();
        assert_eq!(reloaded.version, 1);
        let state = YrsDocument::from_state(&reloaded.snapshot).unwrap();
        assert_eq!(state.text("content"), "kept");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_final_flush_keeps_session_resident() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let conn = Uuid::new_v4();
        registry.attach(&key, conn, "alice").await.unwrap();
        let update = YrsDocument::with_client_id(9).insert_text("content", 0, "keep");
        registry.apply_update(&key.document_id, conn, &update).await.unwrap();
        registry.release(&key.document_id, conn).await.unwrap();

        store.set_write_failures(true);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.evict_idle().await.is_empty());
        assert!(registry.stats(&key.document_id).await.unwrap().dirty);

        store.set_write_failures(false);
        assert_eq!(registry.evict_idle().await, vec![key.document_id.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_documents_left_unflushed() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let key = key();
        let conn = Uuid::new_v4();
        registry.attach(&key, conn, "alice").await.unwrap();
        let update = YrsDocument::with_client_id(4).insert_text("content", 0, "x");
        registry.apply_update(&key.document_id, conn, &update).await.unwrap();

        store.set_unavailable(true);
        assert_eq!(registry.shutdown(Duration::from_secs(1)).await, vec![key.document_id.clone()]);

        store.set_unavailable(false);
        assert!(registry.shutdown(Duration::from_secs(1)).await.is_empty());
        assert_eq!(store.upsert_count(), 1);
    }
}
