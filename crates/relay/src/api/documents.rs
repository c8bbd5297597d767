// Document observability endpoints.
//
// Routes:
//   GET /v1/documents                       every resident session
//   GET /v1/documents/{document_id}         one session's stats
//   GET /v1/documents/{document_id}/users   attached participants
//
// `document_id` is `workspace:path`; slashes in the path are percent-encoded.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tandem_common::types::{DocumentId, DocumentKey, DocumentStats, ParticipantInfo};

use crate::error::{ApiError, ErrorCode};
use crate::AppState;

#[derive(Serialize)]
struct DocumentsEnvelope {
    items: Vec<DocumentStats>,
}

#[derive(Serialize)]
struct DocumentEnvelope {
    document: DocumentStats,
}

#[derive(Serialize)]
struct UsersEnvelope {
    document_id: DocumentId,
    users: Vec<ParticipantInfo>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/documents", get(list_documents))
        .route("/v1/documents/{document_id}", get(get_document))
        .route("/v1/documents/{document_id}/users", get(list_users))
}

async fn list_documents(State(state): State<AppState>) -> Json<DocumentsEnvelope> {
    Json(DocumentsEnvelope { items: state.engine.all_documents().await })
}

async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentEnvelope>, ApiError> {
    let document_id = parse_document_id(&document_id)?;
    let document = state
        .engine
        .document_stats(&document_id)
        .await
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "document is not resident"))?;
    Ok(Json(DocumentEnvelope { document }))
}

async fn list_users(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<UsersEnvelope>, ApiError> {
    let document_id = parse_document_id(&document_id)?;
    let users = state
        .engine
        .document_users(&document_id)
        .await
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "document is not resident"))?;
    Ok(Json(UsersEnvelope { document_id, users }))
}

/// Canonicalize so `ws1:./src\main.py` finds `ws1:src/main.py`.
fn parse_document_id(raw: &str) -> Result<DocumentId, ApiError> {
    Ok(DocumentKey::parse(&DocumentId::from(raw))?.document_id)
}
