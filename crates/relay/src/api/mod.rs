// Read-only observability endpoints over resident document sessions.

mod documents;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    documents::router()
}
