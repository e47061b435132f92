//! Axum router construction.

use axum::routing::{get, post};
use axum::Router;

use crate::server::handlers;
use crate::server::state::SharedState;

/// Build the complete Axum router with all API routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health::health_handler))
        // Emergency API
        .route(
            "/emergency/start",
            post(handlers::emergency::start_handler),
        )
        // WebSocket; registered before `/emergency/:session_id` so the
        // static segment wins.
        .route("/emergency/ws", get(handlers::websocket::ws_handler))
        .route(
            "/emergency/:session_id",
            get(handlers::emergency::get_session_handler),
        )
        .route(
            "/emergency/:session_id/location",
            post(handlers::emergency::location_handler),
        )
        .route(
            "/emergency/:session_id/cancel",
            post(handlers::emergency::cancel_handler),
        )
        .route(
            "/emergency/:session_id/safe-screen",
            post(handlers::emergency::safe_screen_handler),
        )
        .route(
            "/emergency/:session_id/ack",
            post(handlers::emergency::ack_handler),
        )
        .with_state(state)
}
