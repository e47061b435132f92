//! WebSocket upgrade and connection handling.
//!
//! Each connection registers with the [`Broadcaster`](crate::broadcast::Broadcaster)
//! and owns one outbound queue.  Clients pick the sessions they follow with
//! `join:session` / `leave:session` frames.
//!
//! The caller's identity is fixed at upgrade time, from the bearer header or
//! a `token` query parameter.  Owned sessions can only be joined by their
//! owner; anonymous sessions by anyone holding the id.

use std::sync::atomic::Ordering;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::broadcast::{ConnectionId, ServerEvent};
use crate::logging;
use crate::server::state::SharedState;
use crate::server::utils::{api_error, request_owner};

/// Frames accepted from clients.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "join:session", rename_all = "camelCase")]
    Join { session_id: String },
    #[serde(rename = "leave:session", rename_all = "camelCase")]
    Leave { session_id: String },
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= state.max_ws_connections {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!(
                "too many WebSocket connections (max {})",
                state.max_ws_connections
            ),
        );
    }

    let owner = match (request_owner(&state, &headers).await, query.token) {
        (Some(owner), _) => Some(owner),
        (None, Some(token)) => state.directory().resolve_token(&token).await,
        (None, None) => None,
    };

    ws.on_upgrade(|socket| ws_connection(socket, state, owner))
        .into_response()
}

async fn ws_connection(mut socket: WebSocket, state: SharedState, owner: Option<String>) {
    let broadcaster = state.broadcaster().clone();
    let (conn, mut rx) = broadcaster.register().await;
    state.ws_connection_count.fetch_add(1, Ordering::Relaxed);
    crate::tlog!("ws: {} connected", logging::connection_id(conn));

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if socket.send(WsMessage::Text(json)).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    Err(e) => crate::tlog!("ws: failed to encode event: {}", e),
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => handle_client_frame(&state, conn, owner.as_deref(), &text).await,
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = socket.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    broadcaster.disconnect(conn).await;
    state.ws_connection_count.fetch_sub(1, Ordering::Relaxed);
    crate::tlog!("ws: {} disconnected", logging::connection_id(conn));
}

/// Anonymous sessions are open to anyone with the id.
fn may_join(session_owner: Option<&str>, caller: Option<&str>) -> bool {
    match session_owner {
        Some(session_owner) => caller == Some(session_owner),
        None => true,
    }
}

async fn handle_client_frame(
    state: &SharedState,
    conn: ConnectionId,
    owner: Option<&str>,
    text: &str,
) {
    let broadcaster = state.broadcaster();
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            broadcaster
                .send_to(
                    conn,
                    ServerEvent::Error {
                        message: format!("malformed frame: {e}"),
                    },
                )
                .await;
            return;
        }
    };

    match event {
        ClientEvent::Join { session_id } => {
            let store = state.orchestrator.store();
            let allowed = match store.get(&session_id).await {
                Some(session) => may_join(session.owner_id.as_deref(), owner),
                None => false,
            };
            if !allowed {
                crate::tlog!(
                    "ws: {} refused join of {}",
                    logging::connection_id(conn),
                    logging::session_id(&session_id)
                );
                // Same reply for unknown and foreign sessions.
                broadcaster
                    .send_to(
                        conn,
                        ServerEvent::Error {
                            message: "session not found".to_string(),
                        },
                    )
                    .await;
                return;
            }
            broadcaster.join(conn, &session_id).await;
            // Queued behind anything published since the join, so the client
            // never sees an older state after a newer one.
            if let Some(snapshot) = store.snapshot(&session_id).await {
                broadcaster
                    .send_to(conn, ServerEvent::SessionUpdate(snapshot))
                    .await;
            }
        }
        ClientEvent::Leave { session_id } => {
            broadcaster.leave(conn, &session_id).await;
        }
    }
}
