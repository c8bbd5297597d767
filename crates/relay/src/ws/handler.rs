use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tandem_common::protocol::ws::{decode_client_message, encode_server_message, ServerMessage};
use tandem_common::types::UserId;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, MAX_FRAME_BYTES};
use crate::error::{ApiError, ErrorCode};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub user_id: Option<String>,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match connecting_user(query) {
        Ok(user_id) => user_id,
        Err(error) => return error.into_response(),
    };
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, user_id, socket))
}

fn connecting_user(query: ConnectQuery) -> Result<UserId, ApiError> {
    query
        .user_id
        .map(|user_id| user_id.trim().to_string())
        .filter(|user_id| !user_id.is_empty())
        .ok_or_else(|| {
            ApiError::new(ErrorCode::ValidationFailed, "user_id query parameter is required")
        })
}

async fn handle_socket(state: AppState, user_id: UserId, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    let mut outbound = state.transport.register(connection_id);
    state.engine.on_connection_open(connection_id, &user_id).await;
    info!(connection_id = %connection_id, user_id = %user_id, "websocket connected");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.reset();
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound.recv() => {
                let Some(message) = maybe_outbound else {
                    break;
                };
                if send_server_message(&mut socket, &message).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw)) => match decode_client_message(raw.as_str()) {
                        // Rejections come back through the transport as error frames.
                        Ok(frame) => {
                            let _ = state.engine.on_message(connection_id, frame).await;
                        }
                        Err(error) => {
                            debug!(
                                connection_id = %connection_id,
                                error = %error,
                                "undecodable frame"
                            );
                            if send_server_message(&mut socket, &invalid_frame()).await.is_err() {
                                break;
                            }
                        }
                    },
                    Ok(Message::Binary(_)) => {
                        if send_server_message(&mut socket, &invalid_frame()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        debug!(
                            connection_id = %connection_id,
                            error = %error,
                            "websocket receive failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    state.engine.on_connection_closed(connection_id).await;
    state.transport.unregister(connection_id);
    info!(connection_id = %connection_id, user_id = %user_id, "websocket disconnected");
}

fn invalid_frame() -> ServerMessage {
    ServerMessage::Error {
        code: "INVALID_MESSAGE".to_string(),
        message: "invalid websocket frame payload".to_string(),
        retryable: false,
        document_id: None,
    }
}

async fn send_server_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let encoded = encode_server_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
