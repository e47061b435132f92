//! Adapters for the side effects each action kind performs.
//!
//! The orchestrator only knows the [`Capability`] contract: one `attempt`
//! either succeeds with a human-readable detail or fails with a retryable
//! [`CapabilityError`].  What actually happens (sharing a location, texting
//! contacts, backing up evidence, paging responders) belongs to the
//! surrounding system.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;

use crate::logging;
use crate::model::{
    ActionKind, EmergencySession, LocationPing, RiskLevel, SessionId, TrustedContact,
};

/// Everything a capability may need for one attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRequest {
    pub session_id: SessionId,
    #[serde(rename = "action")]
    pub kind: ActionKind,
    /// 1-based attempt number.
    pub attempt: u32,
    pub owner_id: Option<String>,
    pub risk_level: RiskLevel,
    /// Alertable contacts only; unsafe contacts never reach a capability.
    pub contacts: Vec<TrustedContact>,
    pub last_location: Option<LocationPing>,
}

impl AttemptRequest {
    pub fn for_session(session: &EmergencySession, kind: ActionKind, attempt: u32) -> Self {
        Self {
            session_id: session.id.clone(),
            kind,
            attempt,
            owner_id: session.owner_id.clone(),
            risk_level: session.risk_level,
            contacts: session.alertable_contacts(),
            last_location: session.last_location,
        }
    }
}

/// Every variant is retryable; the executor decides when to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    Unavailable(String),
    Rejected(String),
    Transport(String),
}

impl std::fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityError::Unavailable(e) => write!(f, "unavailable: {e}"),
            CapabilityError::Rejected(e) => write!(f, "rejected: {e}"),
            CapabilityError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for CapabilityError {}

#[async_trait]
pub trait Capability: Send + Sync {
    async fn attempt(&self, request: &AttemptRequest) -> Result<String, CapabilityError>;
}

/// One capability per action kind.
#[derive(Clone)]
pub struct Capabilities {
    location: Arc<dyn Capability>,
    sms: Arc<dyn Capability>,
    evidence: Arc<dyn Capability>,
    responder: Arc<dyn Capability>,
}

impl Capabilities {
    pub fn new(
        location: Arc<dyn Capability>,
        sms: Arc<dyn Capability>,
        evidence: Arc<dyn Capability>,
        responder: Arc<dyn Capability>,
    ) -> Self {
        Self {
            location,
            sms,
            evidence,
            responder,
        }
    }

    /// The same adapter for every kind.
    pub fn uniform(capability: Arc<dyn Capability>) -> Self {
        Self::new(
            Arc::clone(&capability),
            Arc::clone(&capability),
            Arc::clone(&capability),
            capability,
        )
    }

    /// Replace the adapter for one kind.
    pub fn with(mut self, kind: ActionKind, capability: Arc<dyn Capability>) -> Self {
        match kind {
            ActionKind::Location => self.location = capability,
            ActionKind::Sms => self.sms = capability,
            ActionKind::Evidence => self.evidence = capability,
            ActionKind::Responder => self.responder = capability,
        }
        self
    }

    pub fn for_kind(&self, kind: ActionKind) -> Arc<dyn Capability> {
        match kind {
            ActionKind::Location => Arc::clone(&self.location),
            ActionKind::Sms => Arc::clone(&self.sms),
            ActionKind::Evidence => Arc::clone(&self.evidence),
            ActionKind::Responder => Arc::clone(&self.responder),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated: logs what it would do, optionally fails at random
// ---------------------------------------------------------------------------

pub struct SimulatedCapability {
    failure_rate: f64,
    latency: Duration,
}

impl SimulatedCapability {
    pub fn new(failure_rate: f64, latency: Duration) -> Self {
        let failure_rate = if failure_rate.is_nan() {
            0.0
        } else {
            failure_rate.clamp(0.0, 1.0)
        };
        Self {
            failure_rate,
            latency,
        }
    }
}

#[async_trait]
impl Capability for SimulatedCapability {
    async fn attempt(&self, request: &AttemptRequest) -> Result<String, CapabilityError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let fail = rand::thread_rng().gen_bool(self.failure_rate);
        crate::tlog!(
            "simulated {} attempt {} for {}: {}",
            request.kind,
            request.attempt,
            logging::session_id(&request.session_id),
            if fail { "failed" } else { "ok" }
        );
        if fail {
            return Err(CapabilityError::Unavailable("simulated outage".to_string()));
        }
        Ok(match request.kind {
            ActionKind::Location => match request.last_location {
                Some(_) => "live location shared".to_string(),
                None => "location sharing started, awaiting first fix".to_string(),
            },
            ActionKind::Sms => format!("alert sent to {} contact(s)", request.contacts.len()),
            ActionKind::Evidence => "evidence backup completed".to_string(),
            ActionKind::Responder => "responders notified".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Webhook: hands the attempt to an external notifier service over HTTP
// ---------------------------------------------------------------------------

/// POSTs each attempt as JSON to `{base_url}/actions/{kind}`.  Any 2xx is a
/// success; everything else is a retryable failure.
pub struct WebhookCapability {
    base_url: String,
    timeout: Duration,
}

impl WebhookCapability {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }

    fn endpoint(&self, kind: ActionKind) -> String {
        format!(
            "{}/actions/{}",
            self.base_url.trim_end_matches('/'),
            kind.as_str().to_lowercase()
        )
    }
}

#[async_trait]
impl Capability for WebhookCapability {
    async fn attempt(&self, request: &AttemptRequest) -> Result<String, CapabilityError> {
        let url = self.endpoint(request.kind);
        let body = serde_json::to_value(request)
            .map_err(|e| CapabilityError::Rejected(format!("serialize request: {e}")))?;
        let timeout = self.timeout;

        // ureq is blocking; keep it off the async workers.
        let result = tokio::task::spawn_blocking(move || {
            ureq::post(&url).timeout(timeout).send_json(body)
        })
        .await
        .map_err(|e| CapabilityError::Transport(format!("notifier task: {e}")))?;

        match result {
            Ok(response) => Ok(format!("notifier accepted ({})", response.status())),
            Err(ureq::Error::Status(code, _)) => {
                Err(CapabilityError::Rejected(format!("notifier returned {code}")))
            }
            Err(e) => Err(CapabilityError::Transport(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted: replays a fixed sequence of outcomes
// ---------------------------------------------------------------------------

/// Returns the queued outcomes in order, then succeeds.  Used for demos and
/// deterministic tests.
pub struct ScriptedCapability {
    outcomes: Mutex<VecDeque<Result<String, CapabilityError>>>,
    calls: AtomicU32,
    delay: Duration,
}

impl ScriptedCapability {
    pub fn new(outcomes: Vec<Result<String, CapabilityError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    /// `failures` consecutive failures followed by successes.
    pub fn failing(failures: usize) -> Self {
        Self::new(
            (0..failures)
                .map(|i| Err(CapabilityError::Unavailable(format!("scripted failure {}", i + 1))))
                .collect(),
        )
    }

    pub fn always_ok() -> Self {
        Self::new(Vec::new())
    }

    /// Hold every attempt for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn attempt(&self, request: &AttemptRequest) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Ok(format!("{} done", request.kind)))
    }
}
