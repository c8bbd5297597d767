// Ephemeral presence (cursor, selection, display name) per document and user.
//
// Entries are never persisted. Each carries a heartbeat; entries that stop
// hearing from their user are pruned by the sweeper.

use std::collections::HashMap;
use std::time::Duration;

use tandem_common::protocol::ws::AwarenessPeer;
use tandem_common::types::{DocumentId, UserId};
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct AwarenessEntry {
    payload: serde_json::Value,
    last_seen: Instant,
}

/// Tracks per-document presence keyed by user.
#[derive(Debug)]
pub struct AwarenessTracker {
    state: RwLock<HashMap<DocumentId, HashMap<UserId, AwarenessEntry>>>,
    timeout: Duration,
}

impl AwarenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self { state: RwLock::new(HashMap::new()), timeout }
    }

    /// Overwrite the user's entry for a document.
    pub async fn set(
        &self,
        document_id: &DocumentId,
        user_id: &str,
        payload: serde_json::Value,
    ) {
        let mut guard = self.state.write().await;
        guard.entry(document_id.clone()).or_default().insert(
            user_id.to_string(),
            AwarenessEntry { payload, last_seen: Instant::now() },
        );
    }

    /// Remove the user's entry. Returns whether one existed.
    pub async fn clear(&self, document_id: &DocumentId, user_id: &str) -> bool {
        let mut guard = self.state.write().await;
        let Some(doc_state) = guard.get_mut(document_id) else {
            return false;
        };
        let removed = doc_state.remove(user_id).is_some();
        if doc_state.is_empty() {
            guard.remove(document_id);
        }
        removed
    }

    /// Refresh the heartbeat without changing the payload.
    pub async fn touch(&self, document_id: &DocumentId, user_id: &str) -> bool {
        let mut guard = self.state.write().await;
        match guard.get_mut(document_id).and_then(|doc_state| doc_state.get_mut(user_id)) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Current entries for a document, ordered by user id.
    pub async fn snapshot(&self, document_id: &DocumentId) -> Vec<AwarenessPeer> {
        let guard = self.state.read().await;
        let mut peers: Vec<AwarenessPeer> = guard
            .get(document_id)
            .map(|doc_state| {
                doc_state
                    .iter()
                    .map(|(user_id, entry)| AwarenessPeer {
                        user_id: user_id.clone(),
                        payload: entry.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    /// Drop entries whose heartbeat is older than the timeout.
    pub async fn prune_expired(&self) -> Vec<(DocumentId, UserId)> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        let mut expired = Vec::new();
        for (document_id, doc_state) in guard.iter_mut() {
            doc_state.retain(|user_id, entry| {
                let alive = now.saturating_duration_since(entry.last_seen) < self.timeout;
                if !alive {
                    expired.push((document_id.clone(), user_id.clone()));
                }
                alive
            });
        }
        guard.retain(|_, doc_state| !doc_state.is_empty());
        expired.sort();
        expired
    }
}
