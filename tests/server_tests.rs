//! HTTP and WebSocket tests against an in-process server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use haven::broadcast::Broadcaster;
use haven::capability::{Capabilities, ScriptedCapability};
use haven::config::OrchestratorConfig;
use haven::directory::{ContactEntry, StaticDirectory};
use haven::orchestrator::Orchestrator;
use haven::server::router::build_router;
use haven::server::state::AppState;
use haven::store::SessionStore;

struct TestServer {
    base_url: String,
    ws_url: String,
    state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_owner(
            "alice",
            "tok-alice",
            "2468",
            vec![
                ContactEntry {
                    name: "Ana".into(),
                    phone: "+1 555 0001".into(),
                    relationship: "sister".into(),
                    is_safe: true,
                    notes: None,
                },
                ContactEntry {
                    name: "Ben".into(),
                    phone: "+15550002".into(),
                    relationship: "ex-partner".into(),
                    is_safe: false,
                    notes: None,
                },
            ],
        )
        .and_then(|d| d.with_owner("bob", "tok-bob", "1357", Vec::new()))
        .expect("directory")
}

async fn start_server_with(max_ws_connections: usize) -> TestServer {
    let store = Arc::new(SessionStore::new(Broadcaster::new(), 50));
    let orchestrator = Orchestrator::new(
        store,
        Arc::new(directory()),
        Capabilities::uniform(Arc::new(ScriptedCapability::always_ok())),
        OrchestratorConfig {
            retry_backoff: vec![Duration::from_millis(5)],
            ..OrchestratorConfig::default()
        },
    )
    .with_anonymous_pin("0000");
    let state =
        Arc::new(AppState::new(Arc::new(orchestrator)).with_max_ws_connections(max_ws_connections));

    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        ws_url: format!("ws://{}/emergency/ws", addr),
        state,
        shutdown: Some(shutdown_tx),
    }
}

async fn start_server() -> TestServer {
    start_server_with(16).await
}

fn into_status_json(result: Result<ureq::Response, ureq::Error>) -> (u16, Value) {
    match result {
        Ok(response) => {
            let status = response.status();
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(ureq::Error::Status(status, response)) => {
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(e) => panic!("transport error: {e}"),
    }
}

async fn post(url: String, body: Value, token: Option<&str>) -> (u16, Value) {
    let auth = token.map(|t| format!("Bearer {t}"));
    tokio::task::spawn_blocking(move || {
        let mut request = ureq::post(&url);
        if let Some(auth) = &auth {
            request = request.set("Authorization", auth);
        }
        into_status_json(request.send_json(body))
    })
    .await
    .expect("blocking post")
}

async fn post_raw(url: String, body: &'static str) -> (u16, Value) {
    tokio::task::spawn_blocking(move || {
        into_status_json(
            ureq::post(&url)
                .set("Content-Type", "application/json")
                .send_string(body),
        )
    })
    .await
    .expect("blocking post")
}

async fn get(url: String, token: Option<&str>) -> (u16, Value) {
    let auth = token.map(|t| format!("Bearer {t}"));
    tokio::task::spawn_blocking(move || {
        let mut request = ureq::get(&url);
        if let Some(auth) = &auth {
            request = request.set("Authorization", auth);
        }
        into_status_json(request.call())
    })
    .await
    .expect("blocking get")
}

async fn start_session(server: &TestServer, token: Option<&str>) -> String {
    let (status, body) = post(
        format!("{}/emergency/start", server.base_url),
        json!({ "riskLevel": "HIGH" }),
        token,
    )
    .await;
    assert_eq!(status, 200);
    body["sessionId"].as_str().expect("sessionId").to_string()
}

#[tokio::test]
async fn health_reports_sessions_and_connections() {
    let server = start_server().await;
    let (status, body) = get(format!("{}/api/health", server.base_url), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["connections"], 0);

    start_session(&server, None).await;
    let (_, body) = get(format!("{}/api/health", server.base_url), None).await;
    assert_eq!(body["sessions"], 1);
}

#[tokio::test]
async fn start_returns_four_actions_and_is_idempotent_per_owner() {
    let server = start_server().await;
    let (status, body) = post(
        format!("{}/emergency/start", server.base_url),
        json!({ "riskLevel": "HIGH" }),
        Some("tok-alice"),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);
    let actions = body["actions"].as_array().expect("actions");
    let kinds: Vec<&str> = actions
        .iter()
        .map(|a| a["type"].as_str().expect("type"))
        .collect();
    assert_eq!(kinds, ["LOCATION", "SMS", "EVIDENCE", "RESPONDER"]);
    assert!(actions.iter().all(|a| a["retryCount"] == 0));

    let first = body["sessionId"].as_str().expect("sessionId").to_string();
    assert_eq!(first.len(), 22);
    let second = start_session(&server, Some("tok-alice")).await;
    assert_eq!(first, second);

    // Anonymous starts, including unknown tokens, never share a session.
    let anon_a = start_session(&server, None).await;
    let anon_b = start_session(&server, Some("tok-unknown")).await;
    assert_ne!(anon_a, anon_b);
    assert_ne!(anon_a, first);
}

#[tokio::test]
async fn start_accepts_empty_body_and_rejects_garbage() {
    let server = start_server().await;
    let (status, body) = post_raw(format!("{}/emergency/start", server.base_url), "").await;
    assert_eq!(status, 200);
    assert!(body["sessionId"].is_string());

    let (status, body) =
        post_raw(format!("{}/emergency/start", server.base_url), "{\"riskLevel\":7}").await;
    assert_eq!(status, 400);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn location_validates_and_throttles() {
    let server = start_server().await;
    let id = start_session(&server, Some("tok-alice")).await;
    let url = format!("{}/emergency/{}/location", server.base_url, id);

    let (status, body) = post(url.clone(), json!({ "lat": 95.0, "lng": 0.0, "accuracy": 5.0 }), None).await;
    assert_eq!(status, 400);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().expect("error").contains("latitude"));

    let (status, _) = post_raw(url.clone(), "{\"lat\":\"north\"}").await;
    assert_eq!(status, 400);

    let (status, body) = post(url.clone(), json!({ "lat": 52.5, "lng": 13.4, "accuracy": 5.0 }), None).await;
    assert_eq!((status, body["ok"].clone()), (200, json!(true)));
    let (status, body) = post(url.clone(), json!({ "lat": 52.6, "lng": 13.4, "accuracy": 5.0 }), None).await;
    assert_eq!((status, body["ok"].clone()), (200, json!(true)));

    let session = server
        .state
        .orchestrator
        .store()
        .get(&id)
        .await
        .expect("session");
    assert_eq!(session.pings.len(), 1);
    assert_eq!(session.last_location.map(|p| p.lat), Some(52.5));

    let (status, body) = post(
        format!("{}/emergency/unknown/location", server.base_url),
        json!({ "lat": 1.0, "lng": 1.0, "accuracy": 1.0 }),
        None,
    )
    .await;
    assert_eq!((status, body["ok"].clone()), (200, json!(true)));
}

#[tokio::test]
async fn cancel_checks_pin_without_revealing_sessions() {
    let server = start_server().await;
    let id = start_session(&server, Some("tok-alice")).await;

    let (status, wrong) = post(
        format!("{}/emergency/{}/cancel", server.base_url, id),
        json!({ "pin": "9999" }),
        None,
    )
    .await;
    assert_eq!(status, 403);
    let (status, unknown) = post(
        format!("{}/emergency/nope/cancel", server.base_url),
        json!({ "pin": "2468" }),
        None,
    )
    .await;
    assert_eq!(status, 403);
    assert_eq!(wrong, unknown);
    assert_eq!(wrong, json!({ "ok": false, "error": "invalid PIN" }));

    let (status, body) = post(
        format!("{}/emergency/{}/cancel", server.base_url, id),
        json!({ "pin": "2468" }),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "ok": true }));

    // Anonymous sessions use the fallback PIN.
    let anon = start_session(&server, None).await;
    let (status, _) = post(
        format!("{}/emergency/{}/cancel", server.base_url, anon),
        json!({ "pin": "0000" }),
        None,
    )
    .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn safe_screen_toggles_status() {
    let server = start_server().await;
    let id = start_session(&server, Some("tok-alice")).await;
    let url = format!("{}/emergency/{}/safe-screen", server.base_url, id);

    let (status, body) = post(url.clone(), json!({ "enabled": true }), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "SAFE_SCREEN");
    let (_, body) = post(url.clone(), json!({ "enabled": false }), None).await;
    assert_eq!(body["status"], "ACTIVE");

    let (status, _) = post(
        format!("{}/emergency/missing/safe-screen", server.base_url),
        json!({ "enabled": true }),
        None,
    )
    .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn ack_records_first_acknowledgement_only() {
    let server = start_server().await;
    let id = start_session(&server, Some("tok-alice")).await;
    let url = format!("{}/emergency/{}/ack", server.base_url, id);

    let (status, body) = post(url.clone(), json!({ "phone": "+15550001", "timestamp": 42 }), None).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "ok": true, "recorded": true }));

    let (_, body) = post(url.clone(), json!({ "contactIndex": 0, "timestamp": 99 }), None).await;
    assert_eq!(body, json!({ "ok": true, "recorded": false }));

    let (status, _) = post(url.clone(), json!({ "contactIndex": 5 }), None).await;
    assert_eq!(status, 404);
    let (status, _) = post(url.clone(), json!({}), None).await;
    assert_eq!(status, 400);

    let session = server
        .state
        .orchestrator
        .store()
        .get(&id)
        .await
        .expect("session");
    assert_eq!(session.contacts[0].ack_at, Some(42));
}

#[tokio::test]
async fn session_is_readable_only_by_its_owner() {
    let server = start_server().await;
    let id = start_session(&server, Some("tok-alice")).await;
    let url = format!("{}/emergency/{}", server.base_url, id);

    let (status, body) = get(url.clone(), Some("tok-alice")).await;
    assert_eq!(status, 200);
    assert_eq!(body["session"]["id"], id.as_str());
    assert_eq!(body["session"]["riskLevel"], "HIGH");
    assert_eq!(body["session"]["contacts"].as_array().map(Vec::len), Some(2));

    let (status, _) = get(url.clone(), Some("tok-bob")).await;
    assert_eq!(status, 404);
    let (status, _) = get(url.clone(), None).await;
    assert_eq!(status, 404);
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_event<F>(ws: &mut WsStream, pred: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).expect("event json");
                    if pred(&value) {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("websocket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Open a realtime connection, optionally with a bearer token.
async fn connect_ws(server: &TestServer, token: Option<&str>) -> WsStream {
    let mut request = server
        .ws_url
        .as_str()
        .into_client_request()
        .expect("ws request");
    if let Some(token) = token {
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
        );
    }
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("connect websocket");
    ws
}

async fn send_join(ws: &mut WsStream, session_id: &str) {
    ws.send(Message::Text(
        json!({ "type": "join:session", "sessionId": session_id }).to_string(),
    ))
    .await
    .expect("send join");
}

#[tokio::test]
async fn websocket_streams_session_and_location_updates() {
    let server = start_server().await;
    let id = start_session(&server, Some("tok-alice")).await;

    let mut ws = connect_ws(&server, Some("tok-alice")).await;

    ws.send(Message::Text("not json".into()))
        .await
        .expect("send garbage");
    let error = next_event(&mut ws, |v| v["type"] == "error").await;
    assert!(error["message"].as_str().expect("message").contains("malformed"));

    send_join(&mut ws, &id).await;
    let snapshot = next_event(&mut ws, |v| v["type"] == "session:update").await;
    assert_eq!(snapshot["sessionId"], id.as_str());
    assert_eq!(snapshot["actions"].as_array().map(Vec::len), Some(4));

    post(
        format!("{}/emergency/{}/location", server.base_url, id),
        json!({ "lat": 48.85, "lng": 2.35, "accuracy": 7.0 }),
        None,
    )
    .await;
    let location = next_event(&mut ws, |v| v["type"] == "location:update").await;
    assert_eq!(location["sessionId"], id.as_str());
    assert_eq!(location["lat"], 48.85);

    post(
        format!("{}/emergency/{}/cancel", server.base_url, id),
        json!({ "pin": "2468" }),
        None,
    )
    .await;
    let resolved = next_event(&mut ws, |v| {
        v["type"] == "session:update" && v["status"] == "RESOLVED"
    })
    .await;
    assert_eq!(resolved["sessionId"], id.as_str());

    ws.close(None).await.expect("close");
}

#[tokio::test]
async fn websocket_join_unknown_session_reports_error() {
    let server = start_server().await;
    let mut ws = connect_ws(&server, None).await;
    send_join(&mut ws, "missing").await;
    let error = next_event(&mut ws, |v| v["type"] == "error").await;
    assert_eq!(error["message"], "session not found");
}

#[tokio::test]
async fn websocket_join_of_owned_session_requires_its_owner() {
    let server = start_server().await;
    let id = start_session(&server, Some("tok-alice")).await;

    for token in [None, Some("tok-bob"), Some("tok-unknown")] {
        let mut ws = connect_ws(&server, token).await;
        send_join(&mut ws, &id).await;
        let reply = next_event(&mut ws, |_| true).await;
        assert_eq!(reply["type"], "error", "token {token:?} was let in");
        assert_eq!(reply["message"], "session not found");
    }

    // Browsers cannot set headers on the upgrade, so the query form works too.
    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("{}?token=tok-alice", server.ws_url))
            .await
            .expect("connect websocket");
    send_join(&mut ws, &id).await;
    let snapshot = next_event(&mut ws, |_| true).await;
    assert_eq!(snapshot["type"], "session:update");
    assert_eq!(snapshot["sessionId"], id.as_str());
}

#[tokio::test]
async fn websocket_anonymous_session_is_joinable_by_id() {
    let server = start_server().await;
    let id = start_session(&server, None).await;

    let mut ws = connect_ws(&server, Some("tok-bob")).await;
    send_join(&mut ws, &id).await;
    let snapshot = next_event(&mut ws, |v| v["type"] == "session:update").await;
    assert_eq!(snapshot["sessionId"], id.as_str());
}

#[tokio::test]
async fn websocket_leave_stops_updates() {
    let server = start_server().await;
    let id = start_session(&server, Some("tok-alice")).await;

    let mut ws = connect_ws(&server, Some("tok-alice")).await;
    send_join(&mut ws, &id).await;
    next_event(&mut ws, |v| v["type"] == "session:update").await;

    ws.send(Message::Text(
        json!({ "type": "leave:session", "sessionId": id }).to_string(),
    ))
    .await
    .expect("send leave");
    // Frames are handled in order, so this reply means the leave landed.
    send_join(&mut ws, "missing").await;
    next_event(&mut ws, |v| v["type"] == "error").await;

    let (status, _) = post(
        format!("{}/emergency/{}/location", server.base_url, id),
        json!({ "lat": 48.85, "lng": 2.35, "accuracy": 7.0 }),
        None,
    )
    .await;
    assert_eq!(status, 200);
    post(
        format!("{}/emergency/{}/safe-screen", server.base_url, id),
        json!({ "enabled": true }),
        None,
    )
    .await;

    let quiet = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(quiet.is_err(), "received after leave: {quiet:?}");
}

#[tokio::test]
async fn websocket_connection_limit_is_enforced() {
    let server = start_server_with(1).await;
    let (mut first, _) = tokio_tungstenite::connect_async(server.ws_url.as_str())
        .await
        .expect("first connection");

    // Wait until the first connection is counted.
    for _ in 0..50 {
        if server.state.ws_connections() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.state.ws_connections(), 1);
    assert!(tokio_tungstenite::connect_async(server.ws_url.as_str())
        .await
        .is_err());

    first.close(None).await.expect("close");
}
