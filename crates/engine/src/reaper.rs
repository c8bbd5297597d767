// Idle reaper and crash-recovery record sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::crdt::CrdtState;
use crate::registry::DocumentRegistry;

/// Periodically evicts sessions that have had no participants for the idle
/// grace period. Runs until `shutdown` fires.
pub async fn run_reaper<C: CrdtState>(
    registry: Arc<DocumentRegistry<C>>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    info!(interval_ms = interval.as_millis() as u64, "idle reaper started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("idle reaper shutting down");
                break;
            }

            _ = ticker.tick() => {
                let evicted = registry.evict_idle().await;
                if !evicted.is_empty() {
                    debug!(evicted = evicted.len(), "reaper pass complete");
                }
            }
        }
    }
}

/// Deletes persisted records untouched for `retention`. Documents resident in
/// `registry` keep their records however old they are.
pub async fn run_record_sweeper<C: CrdtState>(
    registry: Arc<DocumentRegistry<C>>,
    retention: Duration,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        retention_secs = retention.as_secs(),
        interval_secs = interval.as_secs(),
        "record sweeper started"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("record sweeper shutting down");
                break;
            }

            _ = ticker.tick() => {
                match registry.sweep_inactive_records(retention).await {
                    Ok(0) => {}
                    Ok(deleted) => info!(deleted, "deleted inactive document records"),
                    Err(error) => warn!(error = %error, "inactive record sweep failed"),
                }
            }
        }
    }
}
