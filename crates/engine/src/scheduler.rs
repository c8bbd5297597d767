// Persistence scheduler: flushes dirty sessions on a fixed tick or when
// explicitly triggered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::crdt::CrdtState;
use crate::registry::DocumentRegistry;

/// Requests an immediate flush pass outside the regular tick.
#[derive(Debug, Clone, Default)]
pub struct FlushTrigger {
    notify: Arc<Notify>,
}

impl FlushTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Runs until `shutdown` fires. Updates arriving within one tick coalesce
/// into a single flush per session.
pub async fn run_scheduler<C: CrdtState>(
    registry: Arc<DocumentRegistry<C>>,
    interval: Duration,
    trigger: FlushTrigger,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    info!(interval_ms = interval.as_millis() as u64, "persistence scheduler started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("persistence scheduler shutting down");
                break;
            }

            _ = ticker.tick() => {}

            _ = trigger.notify.notified() => {
                debug!("explicit flush requested");
            }
        }

        let report = registry.flush_dirty().await;
        if !report.flushed.is_empty() {
            debug!(flushed = report.flushed.len(), "flush pass complete");
        }
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "flush pass left documents dirty");
        }
    }
}
