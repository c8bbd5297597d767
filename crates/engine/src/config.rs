// Engine timing configuration.
//
// Every interval and window is configurable; the defaults suit a single
// relay process serving interactive editors.

use std::time::Duration;

/// Timing knobs for the registry and its background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Persistence scheduler tick. Upper bound on the data-loss window.
    pub flush_interval: Duration,
    /// How long a vacated session stays resident for instant rejoin.
    pub idle_grace: Duration,
    /// How often the reaper looks for idle sessions.
    pub reaper_interval: Duration,
    /// Presence entries without a heartbeat for this long are cleared.
    pub awareness_timeout: Duration,
    /// How often expired presence entries are swept.
    pub awareness_sweep_interval: Duration,
    /// Upper bound on a single store read during acquire.
    pub load_timeout: Duration,
    /// Total budget for the final flush on shutdown.
    pub shutdown_flush_timeout: Duration,
    /// Persisted records untouched for this long are deleted by the record
    /// sweeper. `None` disables the sweep.
    pub record_retention: Option<Duration>,
    /// How often the record sweeper runs when enabled.
    pub record_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(2_000),
            idle_grace: Duration::from_millis(60_000),
            reaper_interval: Duration::from_millis(10_000),
            awareness_timeout: Duration::from_millis(30_000),
            awareness_sweep_interval: Duration::from_millis(5_000),
            load_timeout: Duration::from_millis(5_000),
            shutdown_flush_timeout: Duration::from_millis(10_000),
            record_retention: None,
            record_sweep_interval: Duration::from_secs(3_600),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_FLUSH_INTERVAL_MS` | `2000` |
    /// | `TANDEM_IDLE_GRACE_MS` | `60000` |
    /// | `TANDEM_REAPER_INTERVAL_MS` | `10000` |
    /// | `TANDEM_AWARENESS_TIMEOUT_MS` | `30000` |
    /// | `TANDEM_AWARENESS_SWEEP_INTERVAL_MS` | `5000` |
    /// | `TANDEM_LOAD_TIMEOUT_MS` | `5000` |
    /// | `TANDEM_SHUTDOWN_FLUSH_TIMEOUT_MS` | `10000` |
    /// | `TANDEM_RECORD_RETENTION_SECS` | *(unset, sweep disabled)* |
    /// | `TANDEM_RECORD_SWEEP_INTERVAL_SECS` | `3600` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    /// Unparseable or zero intervals fall back to the defaults.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            positive_u64(&env, key).map(Duration::from_millis).unwrap_or(default)
        };
        let secs = |key: &str| positive_u64(&env, key).map(Duration::from_secs);

        Self {
            flush_interval: millis("TANDEM_FLUSH_INTERVAL_MS", defaults.flush_interval),
            idle_grace: millis("TANDEM_IDLE_GRACE_MS", defaults.idle_grace),
            reaper_interval: millis("TANDEM_REAPER_INTERVAL_MS", defaults.reaper_interval),
            awareness_timeout: millis("TANDEM_AWARENESS_TIMEOUT_MS", defaults.awareness_timeout),
            awareness_sweep_interval: millis(
                "TANDEM_AWARENESS_SWEEP_INTERVAL_MS",
                defaults.awareness_sweep_interval,
            ),
            load_timeout: millis("TANDEM_LOAD_TIMEOUT_MS", defaults.load_timeout),
            shutdown_flush_timeout: millis(
                "TANDEM_SHUTDOWN_FLUSH_TIMEOUT_MS",
                defaults.shutdown_flush_timeout,
            ),
            record_retention: secs("TANDEM_RECORD_RETENTION_SECS"),
            record_sweep_interval: secs("TANDEM_RECORD_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.record_sweep_interval),
        }
    }
}

fn positive_u64<F>(env: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key).ok().and_then(|value| value.trim().parse::<u64>().ok()).filter(|value| *value > 0)
}
