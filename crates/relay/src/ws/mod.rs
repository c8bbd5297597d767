// WebSocket transport binding: one socket per connection, frames pumped
// between the socket and the engine.

mod handler;

use std::time::Duration;

use axum::{routing::get, Router};

use crate::AppState;

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub(crate) const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);
pub(crate) const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/ws", get(handler::ws_upgrade))
}
