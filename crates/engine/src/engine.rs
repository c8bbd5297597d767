// Transport-facing engine: wires the registry, fanout and background tasks
// together and dispatches client frames.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tandem_common::protocol::ws::{decode_payload, ClientMessage, ServerMessage};
use tandem_common::types::{
    ConnectionId, DocumentId, DocumentKey, DocumentStats, ParticipantInfo, UserId,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::awareness::AwarenessTracker;
use crate::config::EngineConfig;
use crate::crdt::{CrdtState, YrsDocument};
use crate::error::EngineError;
use crate::fanout::{run_awareness_sweeper, Fanout};
use crate::reaper::{run_reaper, run_record_sweeper};
use crate::registry::DocumentRegistry;
use crate::scheduler::{run_scheduler, FlushTrigger};
use crate::store::DocumentStore;
use crate::transport::Transport;

/// Background tasks owned by one engine, stopped together.
pub struct BackgroundTasks {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "background task ended abnormally");
            }
        }
    }
}

#[derive(Debug)]
struct ConnectionState {
    user_id: UserId,
    documents: HashSet<DocumentId>,
}

pub struct CollabEngine<C = YrsDocument> {
    config: EngineConfig,
    registry: Arc<DocumentRegistry<C>>,
    awareness: Arc<AwarenessTracker>,
    fanout: Arc<Fanout<C>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionState>>,
    flush_trigger: FlushTrigger,
    tasks: Mutex<Option<BackgroundTasks>>,
    shutting_down: AtomicBool,
}

impl<C: CrdtState> CollabEngine<C> {
    /// Build an engine without background tasks.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let registry = Arc::new(DocumentRegistry::new(store, &config));
        let awareness = Arc::new(AwarenessTracker::new(config.awareness_timeout));
        let fanout = Arc::new(Fanout::new(registry.clone(), awareness.clone(), transport));
        Self {
            config,
            registry,
            awareness,
            fanout,
            connections: RwLock::new(HashMap::new()),
            flush_trigger: FlushTrigger::new(),
            tasks: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Build an engine and spawn its scheduler, reaper and sweepers on the
    /// current runtime.
    pub fn start(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let mut engine = Self::new(config, store, transport);
        let tasks = engine.spawn_tasks();
        engine.tasks = Mutex::new(Some(tasks));
        info!(
            flush_interval_ms = engine.config.flush_interval.as_millis() as u64,
            idle_grace_ms = engine.config.idle_grace.as_millis() as u64,
            "collaboration engine started"
        );
        Arc::new(engine)
    }

    fn spawn_tasks(&self) -> BackgroundTasks {
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut handles = vec![
            tokio::spawn(run_scheduler(
                self.registry.clone(),
                self.config.flush_interval,
                self.flush_trigger.clone(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(run_reaper(
                self.registry.clone(),
                self.config.reaper_interval,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(run_awareness_sweeper(
                self.fanout.clone(),
                self.config.awareness_sweep_interval,
                shutdown_tx.subscribe(),
            )),
        ];
        if let Some(retention) = self.config.record_retention {
            handles.push(tokio::spawn(run_record_sweeper(
                self.registry.clone(),
                retention,
                self.config.record_sweep_interval,
                shutdown_tx.subscribe(),
            )));
        }
        BackgroundTasks { shutdown_tx, handles }
    }

    pub async fn on_connection_open(&self, connection_id: ConnectionId, user_id: &str) {
        self.connections.write().await.insert(
            connection_id,
            ConnectionState { user_id: user_id.to_string(), documents: HashSet::new() },
        );
        debug!(connection_id = %connection_id, user_id, "connection opened");
    }

    /// Dispatch one client frame. Failures are also reported to the
    /// connection as an `error` frame.
    pub async fn on_message(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), EngineError> {
        let document_id = frame_document_id(&message);
        let result = self.dispatch(connection_id, message).await;

        if let Err(error) = &result {
            debug!(
                connection_id = %connection_id,
                document_id = ?document_id,
                code = error.code(),
                error = %error,
                "rejected client frame"
            );
            self.fanout.notify(
                connection_id,
                ServerMessage::Error {
                    code: error.code().to_string(),
                    message: error.to_string(),
                    retryable: error.retryable(),
                    document_id,
                },
            );
        }
        result
    }

    async fn dispatch(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let user_id = self
            .connections
            .read()
            .await
            .get(&connection_id)
            .map(|connection| connection.user_id.clone())
            .ok_or(EngineError::UnknownConnection(connection_id))?;

        match message {
            ClientMessage::Join { workspace_id, file_path } => {
                let key = DocumentKey::new(&workspace_id, &file_path)?;
                self.fanout.subscribe(&key, connection_id, &user_id).await?;

                let tracked = match self.connections.write().await.get_mut(&connection_id) {
                    Some(connection) => {
                        connection.documents.insert(key.document_id.clone());
                        true
                    }
                    None => false,
                };
                // Closed while the document was loading.
                if !tracked {
                    self.fanout.unsubscribe(&key.document_id, connection_id).await;
                    return Err(EngineError::UnknownConnection(connection_id));
                }
            }
            ClientMessage::Update { document_id, payload_b64 } => {
                let update = decode_payload(&payload_b64).map_err(|_| EngineError::InvalidPayload)?;
                self.fanout.on_update(&document_id, connection_id, &update).await?;
                self.awareness.touch(&document_id, &user_id).await;
            }
            ClientMessage::Awareness { document_id, payload } => {
                self.fanout.set_awareness(&document_id, connection_id, &user_id, payload).await?;
            }
            ClientMessage::Leave { document_id } => {
                self.fanout.unsubscribe(&document_id, connection_id).await;
                if let Some(connection) = self.connections.write().await.get_mut(&connection_id) {
                    connection.documents.remove(&document_id);
                }
            }
        }
        Ok(())
    }

    /// Detach a closed connection from every document it joined.
    pub async fn on_connection_closed(&self, connection_id: ConnectionId) {
        let Some(connection) = self.connections.write().await.remove(&connection_id) else {
            return;
        };
        for document_id in &connection.documents {
            self.fanout.unsubscribe(document_id, connection_id).await;
        }
        debug!(
            connection_id = %connection_id,
            documents = connection.documents.len(),
            "connection closed"
        );
    }

    pub async fn document_stats(&self, document_id: &DocumentId) -> Option<DocumentStats> {
        self.registry.stats(document_id).await
    }

    pub async fn all_documents(&self) -> Vec<DocumentStats> {
        self.registry.list_all().await
    }

    pub async fn document_users(&self, document_id: &DocumentId) -> Option<Vec<ParticipantInfo>> {
        self.registry.participants(document_id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Ask the scheduler for a flush pass now.
    pub fn trigger_flush(&self) {
        self.flush_trigger.trigger();
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry<C>> {
        &self.registry
    }

    /// Stop background tasks, then flush every session within
    /// `shutdown_flush_timeout`. Returns the documents left unflushed.
    pub async fn shutdown(&self) -> Vec<DocumentId> {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.stop().await;
        }
        let unflushed = self.registry.shutdown(self.config.shutdown_flush_timeout).await;
        info!(unflushed = unflushed.len(), "collaboration engine stopped");
        unflushed
    }
}

fn frame_document_id(message: &ClientMessage) -> Option<DocumentId> {
    match message {
        ClientMessage::Join { workspace_id, file_path } => {
            DocumentKey::new(workspace_id, file_path).ok().map(|key| key.document_id)
        }
        ClientMessage::Update { document_id, .. }
        | ClientMessage::Awareness { document_id, .. }
        | ClientMessage::Leave { document_id } => Some(document_id.clone()),
    }
}
