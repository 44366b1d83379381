//! WebSocket endpoint.

use axum::{
    Json,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::GatewayState;
use super::protocol::{ClientMessage, ServerMessage};
use super::session::Session;
use crate::error::GatewayError;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Alternative to a first-frame `auth` message.
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<GatewayState>,
) -> Response {
    // Global cap is enforced before upgrading so overloaded instances shed
    // load with a plain HTTP 503.
    let permit = match state.limiter.try_acquire() {
        Ok(permit) => permit,
        Err(e) => {
            warn!(active = state.limiter.active(), error = %e, "Rejecting WebSocket upgrade");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": e.code(),
                    "message": e.to_string(),
                    "retryable": e.is_retryable(),
                })),
            )
                .into_response();
        }
    };

    debug!("WebSocket client connecting");
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state, params.token).await;
        drop(permit);
    })
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, query_token: Option<String>) {
    let owner_id = match authenticate(&mut socket, &state, query_token).await {
        Ok(owner_id) => owner_id,
        Err(e) => {
            warn!(error = %e, "WebSocket authentication failed");
            reject(&mut socket, &e).await;
            return;
        }
    };

    let _owner_permit = match state.limiter.try_acquire_owner(&owner_id) {
        Ok(permit) => permit,
        Err(e) => {
            warn!(owner_id = %owner_id, error = %e, "Per-owner connection limit reached");
            reject(&mut socket, &e).await;
            return;
        }
    };

    let mut session = Session::new(
        owner_id.clone(),
        state.store.clone(),
        state.registry.clone(),
        state.config.max_rooms_per_connection,
        state.config.backlog_cap,
    );
    let connection_id = session.connection_id();
    info!(connection_id = %connection_id, owner_id = %owner_id, "WebSocket client connected");

    let auth_ok = ServerMessage::AuthOk {
        owner_id,
        connection_id,
    };
    if !send(&mut socket, &auth_ok).await {
        return;
    }

    let idle_timeout = state.config.idle_timeout;
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    // Skip immediate first tick
    heartbeat.tick().await;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    debug!(connection_id = %connection_id, "Heartbeat failed, client gone");
                    break;
                }
            }

            () = &mut idle => {
                info!(connection_id = %connection_id, "Closing idle WebSocket connection");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }

            // Live events from joined rooms
            item = session.next_live(), if session.room_count() > 0 => {
                let Some(item) = item else { continue };
                let frames = match session.on_live(item).await {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "Failed to deliver live event");
                        vec![ServerMessage::from(&e)]
                    }
                };
                if !send_all(&mut socket, &frames).await {
                    break;
                }
            }

            // Frames from the client
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(msg)) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        match msg {
                            Message::Text(text) => {
                                let frames = handle_client_message(&text, &mut session).await;
                                if !send_all(&mut socket, &frames).await {
                                    break;
                                }
                            }
                            Message::Ping(data) => {
                                if socket.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => {
                                debug!(connection_id = %connection_id, "Client closed connection");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    session.close().await;
    info!(connection_id = %connection_id, "WebSocket connection closed");
}

/// Resolve the owner from the query token or the first frame.
async fn authenticate(
    socket: &mut WebSocket,
    state: &GatewayState,
    query_token: Option<String>,
) -> Result<String, GatewayError> {
    if let Some(token) = query_token {
        return state.auth.authenticate(&token).await;
    }

    let first = tokio::time::timeout(state.config.auth_timeout, socket.recv())
        .await
        .map_err(|_| GatewayError::AuthFailed {
            reason: "timed out waiting for auth".to_string(),
        })?;

    match first {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Auth { token }) => state.auth.authenticate(&token).await,
            Ok(_) => Err(GatewayError::AuthFailed {
                reason: "first message must be auth".to_string(),
            }),
            Err(e) => Err(GatewayError::Protocol(format!("invalid auth frame: {e}"))),
        },
        _ => Err(GatewayError::AuthFailed {
            reason: "connection closed before auth".to_string(),
        }),
    }
}

async fn handle_client_message(text: &str, session: &mut Session) -> Vec<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Unrecognized WS message from client");
            let err = GatewayError::Protocol(format!("unrecognized message: {e}"));
            return vec![ServerMessage::from(&err)];
        }
    };

    match message {
        ClientMessage::Subscribe {
            room,
            last_seen_sequence,
            cursors,
        } => match session.subscribe(room, last_seen_sequence, cursors).await {
            Ok(frames) => frames,
            Err(e) => {
                debug!(connection_id = %session.connection_id(), error = %e, "Subscribe rejected");
                vec![ServerMessage::from(&e)]
            }
        },
        ClientMessage::Unsubscribe { room } => vec![session.unsubscribe(room).await],
        ClientMessage::Ping => vec![ServerMessage::Pong],
        ClientMessage::Auth { .. } => {
            let err = GatewayError::Protocol("already authenticated".to_string());
            vec![ServerMessage::from(&err)]
        }
    }
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode server message");
            true
        }
    }
}

async fn send_all(socket: &mut WebSocket, messages: &[ServerMessage]) -> bool {
    for message in messages {
        if !send(socket, message).await {
            debug!("Client disconnected during send");
            return false;
        }
    }
    true
}

async fn reject(socket: &mut WebSocket, err: &GatewayError) {
    let _ = send(socket, &ServerMessage::from(err)).await;
    let _ = socket.send(Message::Close(None)).await;
}
