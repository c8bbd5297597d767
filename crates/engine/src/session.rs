// Per-document session state owned by the registry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tandem_common::types::{
    ConnectionId, DocumentKey, DocumentStats, ParticipantInfo, SessionState, UserId,
};
use tokio::time::{Duration, Instant};
use tracing::warn;

use crate::crdt::{CrdtError, CrdtState};
use crate::store::PersistedDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Resident,
    PendingEviction { since: Instant },
    Evicted,
}

#[derive(Debug, Clone)]
pub(crate) struct Participant {
    pub(crate) user_id: UserId,
    pub(crate) joined_at: DateTime<Utc>,
    pub(crate) last_seen_at: DateTime<Utc>,
}

/// Encoded state captured for a flush, tagged with the edit it includes.
#[derive(Debug, Clone)]
pub(crate) struct FlushSnapshot {
    pub(crate) state: Vec<u8>,
    pub(crate) edit_seq: u64,
    pub(crate) version: i64,
    pub(crate) last_modified_by: Option<UserId>,
    pub(crate) metadata: serde_json::Value,
}

pub(crate) struct DocumentSession<C> {
    pub(crate) key: DocumentKey,
    state: C,
    pub(crate) version: i64,
    pub(crate) dirty: bool,
    /// Count of updates applied since the session became resident.
    edit_seq: u64,
    pub(crate) checksum: Option<String>,
    pub(crate) last_modified_by: Option<UserId>,
    metadata: serde_json::Value,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    pub(crate) last_flushed_at: Option<DateTime<Utc>>,
    pub(crate) participants: HashMap<ConnectionId, Participant>,
    pub(crate) lifecycle: Lifecycle,
}

impl<C: CrdtState> DocumentSession<C> {
    pub(crate) fn new_empty(key: DocumentKey) -> Self {
        Self::with_state(key, C::empty())
    }

    pub(crate) fn from_record(
        key: DocumentKey,
        record: PersistedDocument,
    ) -> Result<Self, CrdtError> {
        let state = C::from_state(&record.state)?;
        let mut session = Self::with_state(key, state);
        session.version = record.version;
        session.checksum = Some(record.checksum);
        session.last_modified_by = record.last_modified_by;
        session.metadata = record.metadata;
        session.last_flushed_at = Some(record.updated_at);
        Ok(session)
    }

    fn with_state(key: DocumentKey, state: C) -> Self {
        let now = Utc::now();
        Self {
            key,
            state,
            version: 0,
            dirty: false,
            edit_seq: 0,
            checksum: None,
            last_modified_by: None,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: now,
            last_activity: Instant::now(),
            last_activity_at: now,
            last_flushed_at: None,
            participants: HashMap::new(),
            lifecycle: Lifecycle::Resident,
        }
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.lifecycle == Lifecycle::Evicted
    }

    /// Register a connection. Returns whether it was new and whether a
    /// pending eviction was cancelled by it.
    pub(crate) fn add_participant(
        &mut self,
        connection_id: ConnectionId,
        user_id: &str,
    ) -> (bool, bool) {
        let now = Utc::now();
        let inserted = match self.participants.get_mut(&connection_id) {
            Some(existing) => {
                existing.last_seen_at = now;
                false
            }
            None => {
                self.participants.insert(
                    connection_id,
                    Participant { user_id: user_id.to_string(), joined_at: now, last_seen_at: now },
                );
                true
            }
        };

        let cancelled = matches!(self.lifecycle, Lifecycle::PendingEviction { .. });
        if cancelled {
            self.lifecycle = Lifecycle::Resident;
        }
        self.touch();
        (inserted, cancelled)
    }

    /// Detach a connection. The last departure schedules eviction.
    pub(crate) fn remove_participant(
        &mut self,
        connection_id: ConnectionId,
    ) -> Option<Participant> {
        let removed = self.participants.remove(&connection_id)?;
        self.touch();
        if self.participants.is_empty() && self.lifecycle == Lifecycle::Resident {
            self.lifecycle = Lifecycle::PendingEviction { since: self.last_activity };
        }
        Some(removed)
    }

    pub(crate) fn apply_update(
        &mut self,
        connection_id: ConnectionId,
        update: &[u8],
    ) -> Result<(), CrdtError> {
        self.state.apply(update)?;
        self.dirty = true;
        self.edit_seq += 1;
        self.touch();
        if let Some(participant) = self.participants.get_mut(&connection_id) {
            participant.last_seen_at = self.last_activity_at;
            self.last_modified_by = Some(participant.user_id.clone());
        }
        Ok(())
    }

    pub(crate) fn encode_state(&self) -> Vec<u8> {
        self.state.encode_state()
    }

    pub(crate) fn flush_snapshot(&self) -> FlushSnapshot {
        FlushSnapshot {
            state: self.state.encode_state(),
            edit_seq: self.edit_seq,
            version: self.version,
            last_modified_by: self.last_modified_by.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Record a successful write of the snapshot taken at `edit_seq`. Dirty is
    /// cleared only when no update landed after that snapshot was encoded.
    /// The session version never moves backwards, even if the store's does.
    pub(crate) fn complete_flush(&mut self, edit_seq: u64, version: i64, checksum: String) {
        if version > self.version {
            self.version = version;
        } else {
            warn!(
                document_id = %self.key.document_id,
                session_version = self.version,
                store_version = version,
                "store returned a version that does not advance the session"
            );
        }
        self.checksum = Some(checksum);
        self.last_flushed_at = Some(Utc::now());
        if self.edit_seq == edit_seq {
            self.dirty = false;
        }
    }

    pub(crate) fn is_idle(&self, now: Instant, grace: Duration) -> bool {
        self.participants.is_empty()
            && self.lifecycle != Lifecycle::Evicted
            && now.saturating_duration_since(self.last_activity) >= grace
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    pub(crate) fn touch_participant(&mut self, connection_id: ConnectionId) {
        if let Some(participant) = self.participants.get_mut(&connection_id) {
            participant.last_seen_at = Utc::now();
        }
    }

    pub(crate) fn stats(&self) -> DocumentStats {
        DocumentStats {
            document_id: self.key.document_id.clone(),
            workspace_id: self.key.workspace_id.clone(),
            file_path: self.key.file_path.clone(),
            state: match self.lifecycle {
                Lifecycle::PendingEviction { .. } => SessionState::PendingEviction,
                Lifecycle::Resident | Lifecycle::Evicted => SessionState::Resident,
            },
            version: self.version,
            dirty: self.dirty,
            participant_count: self.participants.len(),
            checksum: self.checksum.clone(),
            last_modified_by: self.last_modified_by.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            last_flushed_at: self.last_flushed_at,
        }
    }

    pub(crate) fn participant_infos(&self) -> Vec<ParticipantInfo> {
        let mut infos: Vec<ParticipantInfo> = self
            .participants
            .iter()
            .map(|(connection_id, participant)| ParticipantInfo {
                connection_id: *connection_id,
                user_id: participant.user_id.clone(),
                joined_at: participant.joined_at,
                last_seen_at: participant.last_seen_at,
            })
            .collect();
        infos.sort_by(|a, b| {
            a.joined_at.cmp(&b.joined_at).then(a.connection_id.cmp(&b.connection_id))
        });
        infos
    }

    pub(crate) fn other_connections(&self, exclude: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.participants.keys().copied().filter(|id| Some(*id) != exclude).collect()
    }

    pub(crate) fn has_user(&self, user_id: &str) -> bool {
        self.participants.values().any(|participant| participant.user_id == user_id)
    }
}
