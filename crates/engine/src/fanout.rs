// Connection fanout: join/leave notifications, update relay and presence
// broadcast for the participants of each document.
//
// Every mutation goes through the registry first; delivery happens after
// the session lock is released and a failed send only affects its target.

use std::sync::Arc;
use std::time::Duration;

use tandem_common::protocol::ws::{encode_payload, ServerMessage};
use tandem_common::types::{ConnectionId, DocumentId, DocumentKey};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::awareness::AwarenessTracker;
use crate::crdt::{CrdtState, YrsDocument};
use crate::error::{ApplyError, LoadError};
use crate::registry::{DocumentRegistry, Released};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub document_id: DocumentId,
    pub version: i64,
    /// Other connections on the document at join time.
    pub peers: usize,
}

pub struct Fanout<C = YrsDocument> {
    registry: Arc<DocumentRegistry<C>>,
    awareness: Arc<AwarenessTracker>,
    transport: Arc<dyn Transport>,
}

impl<C: CrdtState> Fanout<C> {
    pub fn new(
        registry: Arc<DocumentRegistry<C>>,
        awareness: Arc<AwarenessTracker>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self { registry, awareness, transport }
    }

    /// Join a connection: full-state sync and presence snapshot to the
    /// joiner, `user_joined` to everyone else.
    pub async fn subscribe(
        &self,
        key: &DocumentKey,
        connection_id: ConnectionId,
        user_id: &str,
    ) -> Result<Subscription, LoadError> {
        let attached = self.registry.attach(key, connection_id, user_id).await?;
        let document_id = key.document_id.clone();

        self.deliver(
            &[connection_id],
            &ServerMessage::Sync {
                document_id: document_id.clone(),
                version: attached.version,
                payload_b64: encode_payload(&attached.snapshot),
            },
        );
        self.deliver(
            &[connection_id],
            &ServerMessage::AwarenessSnapshot {
                document_id: document_id.clone(),
                entries: self.awareness.snapshot(&document_id).await,
            },
        );

        if attached.newly_joined {
            self.deliver(
                &attached.peers,
                &ServerMessage::UserJoined {
                    document_id: document_id.clone(),
                    user_id: user_id.to_string(),
                    connection_id,
                },
            );
        }

        debug!(
            document_id = %document_id,
            connection_id = %connection_id,
            user_id,
            version = attached.version,
            peers = attached.peers.len(),
            "connection joined document"
        );
        Ok(Subscription { document_id, version: attached.version, peers: attached.peers.len() })
    }

    /// Apply an update, then relay the same bytes to every other participant.
    /// Returns how many connections it was delivered to.
    pub async fn on_update(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
        update: &[u8],
    ) -> Result<usize, ApplyError> {
        let recipients = self.registry.apply_update(document_id, connection_id, update).await?;
        let delivered = self.deliver(
            &recipients,
            &ServerMessage::Update {
                document_id: document_id.clone(),
                payload_b64: encode_payload(update),
            },
        );
        trace!(
            document_id = %document_id,
            connection_id = %connection_id,
            bytes = update.len(),
            delivered,
            "relayed update"
        );
        Ok(delivered)
    }

    /// Store the user's presence and broadcast it to the other participants.
    pub async fn set_awareness(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
        user_id: &str,
        payload: serde_json::Value,
    ) -> Result<usize, ApplyError> {
        let not_participant =
            || ApplyError::NotParticipant { document_id: document_id.clone(), connection_id };
        if !self.registry.touch_participant(document_id, connection_id).await {
            return Err(not_participant());
        }

        self.awareness.set(document_id, user_id, payload.clone()).await;
        // The user may have left between the check and the set.
        if !self.registry.has_user(document_id, user_id).await {
            if self.awareness.clear(document_id, user_id).await {
                let remaining = self.registry.recipients(document_id, None).await;
                self.deliver(
                    &remaining,
                    &ServerMessage::AwarenessRemoved {
                        document_id: document_id.clone(),
                        user_id: user_id.to_string(),
                    },
                );
            }
            return Err(not_participant());
        }

        let recipients = self.registry.recipients(document_id, Some(connection_id)).await;
        Ok(self.deliver(
            &recipients,
            &ServerMessage::Awareness {
                document_id: document_id.clone(),
                user_id: user_id.to_string(),
                payload,
            },
        ))
    }

    /// Detach a connection and tell the remaining participants. Presence is
    /// cleared once the user has no other connection on the document.
    pub async fn unsubscribe(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
    ) -> Option<Released> {
        let released = self.registry.release(document_id, connection_id).await?;

        if !released.user_still_present
            && self.awareness.clear(document_id, &released.user_id).await
        {
            self.deliver(
                &released.remaining,
                &ServerMessage::AwarenessRemoved {
                    document_id: document_id.clone(),
                    user_id: released.user_id.clone(),
                },
            );
        }

        self.deliver(
            &released.remaining,
            &ServerMessage::UserLeft {
                document_id: document_id.clone(),
                user_id: released.user_id.clone(),
                connection_id,
            },
        );
        debug!(
            document_id = %document_id,
            connection_id = %connection_id,
            remaining = released.remaining.len(),
            "connection left document"
        );
        Some(released)
    }

    /// Expire stale presence and broadcast the removals.
    pub async fn sweep_awareness(&self) -> usize {
        let expired = self.awareness.prune_expired().await;
        for (document_id, user_id) in &expired {
            debug!(document_id = %document_id, user_id = %user_id, "awareness entry timed out");
            let recipients = self.registry.recipients(document_id, None).await;
            self.deliver(
                &recipients,
                &ServerMessage::AwarenessRemoved {
                    document_id: document_id.clone(),
                    user_id: user_id.clone(),
                },
            );
        }
        expired.len()
    }

    /// Send an error frame to a single connection.
    pub fn notify(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        self.deliver(&[connection_id], &message) == 1
    }

    fn deliver(&self, recipients: &[ConnectionId], message: &ServerMessage) -> usize {
        let mut delivered = 0;
        for connection_id in recipients {
            match self.transport.send(*connection_id, message.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    debug!(
                        connection_id = %connection_id,
                        document_id = ?message.document_id(),
                        error = %error,
                        "delivery to connection failed"
                    );
                }
            }
        }
        delivered
    }
}

/// Prunes expired presence every `interval` until `shutdown` fires.
pub async fn run_awareness_sweeper<C: CrdtState>(
    fanout: Arc<Fanout<C>>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                debug!("awareness sweeper shutting down");
                break;
            }

            _ = ticker.tick() => {
                fanout.sweep_awareness().await;
            }
        }
    }
}
