//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::server::state::SharedState;

pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let sessions = state.orchestrator.store().active_sessions().await.len();
    let body = serde_json::json!({
        "status": "ok",
        "sessions": sessions,
        "connections": state.ws_connections(),
    });
    (StatusCode::OK, axum::Json(body))
}
