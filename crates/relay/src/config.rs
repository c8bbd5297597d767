// Relay server configuration.
//
// Core server settings plus the engine's tuning knobs, all read from the
// environment with development defaults.

use std::net::SocketAddr;
use std::path::PathBuf;

use tandem_engine::EngineConfig;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// SQLite database file. `None` keeps documents in memory only.
    pub database_path: Option<PathBuf>,
    /// Log filter directive (e.g. `info`, `tandem_engine=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines instead of the human-readable format.
    pub log_json: bool,
    pub engine: EngineConfig,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_RELAY_HOST` | `0.0.0.0` |
    /// | `TANDEM_RELAY_PORT` | `8080` |
    /// | `TANDEM_RELAY_DATABASE_PATH` | *(none, in-memory store)* |
    /// | `TANDEM_RELAY_LOG_FILTER` | `info` |
    /// | `TANDEM_RELAY_LOG_JSON` | `false` |
    ///
    /// Engine variables are documented on [`EngineConfig::from_env`].
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TANDEM_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("TANDEM_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_path = env("TANDEM_RELAY_DATABASE_PATH")
            .ok()
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let log_filter = env("TANDEM_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("TANDEM_RELAY_LOG_JSON")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            listen_addr,
            database_path,
            log_filter,
            log_json,
            engine: EngineConfig::from_env_fn(&env),
        }
    }
}
