//! Emergency session handlers: start, location, cancel, safe screen, ack.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::ack::{AckOutcome, ContactRef};
use crate::ingest::PingInput;
use crate::logging;
use crate::model::{now_millis, RiskLevel};
use crate::orchestrator::CancelError;
use crate::server::state::SharedState;
use crate::server::utils::{api_error, request_owner};
use crate::store::MutationOutcome;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    risk_level: RiskLevel,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pin: String,
}

#[derive(Deserialize)]
pub struct SafeScreenRequest {
    enabled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    contact_index: Option<usize>,
    phone: Option<String>,
    timestamp: Option<u64>,
}

/// `POST /emergency/start`.  The body is optional; an empty body means
/// `MEDIUM` risk.
pub async fn start_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice::<StartRequest>(&body) {
            Ok(req) => req,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("invalid body: {e}")),
        }
    };

    let owner = request_owner(&state, &headers).await;
    let outcome = state
        .orchestrator
        .trigger(owner.as_deref(), req.risk_level)
        .await;

    let body = serde_json::json!({
        "ok": true,
        "sessionId": outcome.session_id,
        "actions": outcome.actions,
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}

/// `POST /emergency/:session_id/location`.  Throttled pings and pings for
/// unknown or resolved sessions are acknowledged like accepted ones.
pub async fn location_handler(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    payload: Result<axum::Json<PingInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(axum::Json(input)) => input,
        Err(rejection) => return api_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match state.orchestrator.record_location(&session_id, input).await {
        Ok(_) => (StatusCode::OK, axum::Json(serde_json::json!({ "ok": true }))).into_response(),
        Err(e) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// `POST /emergency/:session_id/cancel`.
pub async fn cancel_handler(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    payload: Result<axum::Json<CancelRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(axum::Json(req)) => req,
        Err(rejection) => return api_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match state.orchestrator.cancel(&session_id, &req.pin).await {
        Ok(()) => (StatusCode::OK, axum::Json(serde_json::json!({ "ok": true }))).into_response(),
        Err(e @ CancelError::InvalidPin) => api_error(StatusCode::FORBIDDEN, e.to_string()),
    }
}

/// `POST /emergency/:session_id/safe-screen`.
pub async fn safe_screen_handler(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    payload: Result<axum::Json<SafeScreenRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(axum::Json(req)) => req,
        Err(rejection) => return api_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let outcome = state
        .orchestrator
        .set_safe_screen(&session_id, req.enabled)
        .await;
    match outcome {
        MutationOutcome::NotFound => api_error(StatusCode::NOT_FOUND, "session not found"),
        MutationOutcome::Resolved => api_error(StatusCode::CONFLICT, "session is resolved"),
        MutationOutcome::Applied | MutationOutcome::Unchanged => {
            let status = state.orchestrator.store().status(&session_id).await;
            let body = serde_json::json!({ "ok": true, "status": status });
            (StatusCode::OK, axum::Json(body)).into_response()
        }
    }
}

/// `POST /emergency/:session_id/ack`.  Acknowledgement webhook; the contact
/// is named by index or by phone number.
pub async fn ack_handler(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    payload: Result<axum::Json<AckRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(axum::Json(req)) => req,
        Err(rejection) => return api_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let contact = match (req.contact_index, req.phone) {
        (Some(index), _) => ContactRef::Index(index),
        (None, Some(phone)) if !phone.trim().is_empty() => ContactRef::Phone(phone),
        _ => return api_error(StatusCode::BAD_REQUEST, "contactIndex or phone is required"),
    };
    let at = req.timestamp.unwrap_or_else(now_millis);

    match state.orchestrator.acknowledge(&session_id, &contact, at).await {
        AckOutcome::Recorded => ack_response(true),
        AckOutcome::AlreadyAcknowledged => ack_response(false),
        AckOutcome::UnknownContact => api_error(StatusCode::NOT_FOUND, "unknown contact"),
        AckOutcome::Inactive => {
            crate::tlog!("ack: {} is not active", logging::session_id(&session_id));
            api_error(StatusCode::NOT_FOUND, "session not found")
        }
    }
}

fn ack_response(recorded: bool) -> Response {
    let body = serde_json::json!({ "ok": true, "recorded": recorded });
    (StatusCode::OK, axum::Json(body)).into_response()
}

/// `GET /emergency/:session_id`.  Visible only to the owner's bearer token;
/// everyone else gets a 404.
pub async fn get_session_handler(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let owner = request_owner(&state, &headers).await;
    let session = state.orchestrator.store().get(&session_id).await;
    match (owner, session) {
        (Some(owner), Some(session)) if session.owner_id.as_deref() == Some(owner.as_str()) => {
            let body = serde_json::json!({ "ok": true, "session": session });
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        _ => api_error(StatusCode::NOT_FOUND, "session not found"),
    }
}
