//! Emergency session data model: sessions, actions, trusted contacts and
//! location pings.
//!
//! Everything here serializes with the camelCase field names the realtime
//! clients expect.  State-machine rules for [`Action`] live on the type so
//! that every writer goes through the same guarded transitions.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub type SessionId = String;

/// Number of random bytes behind a session id.
const SESSION_ID_BYTES: usize = 16;

/// Generate a fresh opaque session id (URL-safe, unpadded base64).
pub fn new_session_id() -> SessionId {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Current time as milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// The four automated responses launched for every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Location,
    Sms,
    Evidence,
    Responder,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Location,
        ActionKind::Sms,
        ActionKind::Evidence,
        ActionKind::Responder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Location => "LOCATION",
            ActionKind::Sms => "SMS",
            ActionKind::Evidence => "EVIDENCE",
            ActionKind::Responder => "RESPONDER",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LOCATION" => Ok(ActionKind::Location),
            "SMS" => Ok(ActionKind::Sms),
            "EVIDENCE" => Ok(ActionKind::Evidence),
            "RESPONDER" => Ok(ActionKind::Responder),
            _ => Err(format!("invalid action kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    Queued,
    Running,
    Success,
    Failed,
    Retrying,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionState::Success | ActionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Queued => "queued",
            ActionState::Running => "running",
            ActionState::Success => "success",
            ActionState::Failed => "failed",
            ActionState::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    /// Client-side decoy rendering; the session is still live server-side.
    SafeScreen,
    Resolved,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::SafeScreen => "SAFE_SCREEN",
            SessionStatus::Resolved => "RESOLVED",
        }
    }

    pub fn is_live(self) -> bool {
        !matches!(self, SessionStatus::Resolved)
    }

    /// `ACTIVE ⇄ SAFE_SCREEN`, either of them `→ RESOLVED`, nothing out of
    /// `RESOLVED`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Resolved, _) => false,
            (a, b) if a == b => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(SessionStatus::Active),
            "SAFE_SCREEN" => Ok(SessionStatus::SafeScreen),
            "RESOLVED" => Ok(SessionStatus::Resolved),
            _ => Err(format!("invalid session status: {s}")),
        }
    }
}

/// Risk hint supplied by the client at trigger time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        };
        f.write_str(s)
    }
}

/// Observed state of the outbound SOS alert for one contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    /// Contact is flagged unsafe and never alerted.
    Excluded,
    Pending,
    Sent,
    Failed,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub kind: ActionKind,
    pub from: ActionState,
    pub to: ActionState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: illegal transition {} -> {}",
            self.kind, self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

/// What a failed attempt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Moved to `retrying`; `retry_count` is the new count.
    Retry { retry_count: u32 },
    /// Retries exhausted; the action is now terminally `failed`.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub state: ActionState,
    pub retry_count: u32,
    pub logs: Vec<LogEntry>,
    pub last_updated_at: u64,
}

impl Action {
    pub fn new(kind: ActionKind, now: u64) -> Self {
        Self {
            kind,
            state: ActionState::Queued,
            retry_count: 0,
            logs: Vec::new(),
            last_updated_at: now,
        }
    }

    fn illegal(&self, to: ActionState) -> TransitionError {
        TransitionError {
            kind: self.kind,
            from: self.state,
            to,
        }
    }

    fn log(&mut self, now: u64, message: String) {
        self.logs.push(LogEntry {
            timestamp: now,
            message,
        });
    }

    /// `queued | retrying → running`.
    pub fn begin_attempt(&mut self, now: u64) -> Result<(), TransitionError> {
        match self.state {
            ActionState::Queued | ActionState::Retrying => {
                self.state = ActionState::Running;
                self.last_updated_at = now;
                Ok(())
            }
            _ => Err(self.illegal(ActionState::Running)),
        }
    }

    /// `running → success`.
    pub fn record_success(&mut self, now: u64, detail: &str) -> Result<(), TransitionError> {
        if self.state != ActionState::Running {
            return Err(self.illegal(ActionState::Success));
        }
        self.state = ActionState::Success;
        self.last_updated_at = now;
        self.log(now, detail.to_string());
        Ok(())
    }

    /// A failed attempt: `running → retrying` while retries remain, otherwise
    /// `running → failed`.
    pub fn record_failure(
        &mut self,
        now: u64,
        error: &str,
        max_retries: u32,
    ) -> Result<FailureOutcome, TransitionError> {
        if self.state != ActionState::Running {
            return Err(self.illegal(ActionState::Failed));
        }
        self.last_updated_at = now;
        if self.retry_count < max_retries {
            self.retry_count += 1;
            self.state = ActionState::Retrying;
            self.log(
                now,
                format!(
                    "attempt failed: {error} (retry {}/{max_retries})",
                    self.retry_count
                ),
            );
            Ok(FailureOutcome::Retry {
                retry_count: self.retry_count,
            })
        } else {
            self.state = ActionState::Failed;
            self.log(now, format!("attempt failed: {error} (giving up)"));
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// An attempt that was in flight when the process stopped is re-queued so
    /// it can run again after a restart.  Terminal actions are left alone.
    pub fn requeue_interrupted(&mut self, now: u64) -> bool {
        if self.state != ActionState::Running {
            return false;
        }
        self.state = ActionState::Queued;
        self.last_updated_at = now;
        self.log(now, "attempt interrupted by restart, requeued".to_string());
        true
    }
}

// ---------------------------------------------------------------------------
// Contacts and pings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedContact {
    pub name: String,
    pub phone: String,
    pub relationship: String,
    pub is_safe: bool,
    pub notes: Option<String>,
    pub sms_status: SmsStatus,
    pub ack_at: Option<u64>,
}

impl TrustedContact {
    pub fn new(
        name: impl Into<String>,
        phone: impl Into<String>,
        relationship: impl Into<String>,
        is_safe: bool,
        notes: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
            relationship: relationship.into(),
            is_safe,
            notes,
            sms_status: if is_safe {
                SmsStatus::Pending
            } else {
                SmsStatus::Excluded
            },
            ack_at: None,
        }
    }
}

/// Set the alert status of every safe contact.  Returns whether any changed.
pub fn set_alert_status(contacts: &mut [TrustedContact], status: SmsStatus) -> bool {
    let mut changed = false;
    for contact in contacts.iter_mut().filter(|c| c.is_safe) {
        if contact.sms_status != status {
            contact.sms_status = status;
            changed = true;
        }
    }
    changed
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationPing {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencySession {
    pub id: SessionId,
    pub owner_id: Option<String>,
    pub risk_level: RiskLevel,
    pub status: SessionStatus,
    pub actions: Vec<Action>,
    pub contacts: Vec<TrustedContact>,
    pub pings: VecDeque<LocationPing>,
    pub last_location: Option<LocationPing>,
    pub created_at: u64,
    pub resolved_at: Option<u64>,
}

impl EmergencySession {
    /// A fresh `ACTIVE` session with one queued action per kind.
    pub fn new(
        id: SessionId,
        owner_id: Option<String>,
        risk_level: RiskLevel,
        contacts: Vec<TrustedContact>,
        now: u64,
    ) -> Self {
        Self {
            id,
            owner_id,
            risk_level,
            status: SessionStatus::Active,
            actions: ActionKind::ALL
                .iter()
                .map(|kind| Action::new(*kind, now))
                .collect(),
            contacts,
            pings: VecDeque::new(),
            last_location: None,
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == SessionStatus::Resolved
    }

    pub fn action(&self, kind: ActionKind) -> Option<&Action> {
        self.actions.iter().find(|a| a.kind == kind)
    }

    pub fn action_mut(&mut self, kind: ActionKind) -> Option<&mut Action> {
        self.actions.iter_mut().find(|a| a.kind == kind)
    }

    /// Contacts that receive the SOS alert.
    pub fn alertable_contacts(&self) -> Vec<TrustedContact> {
        self.contacts.iter().filter(|c| c.is_safe).cloned().collect()
    }

    /// Push a ping to the front of the bounded history and make it the last
    /// known location.
    pub fn push_ping(&mut self, ping: LocationPing, capacity: usize) {
        self.pings.push_front(ping);
        while self.pings.len() > capacity {
            self.pings.pop_back();
        }
        self.last_location = Some(ping);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            status: self.status,
            actions: self.actions.clone(),
            contacts: self.contacts.clone(),
            last_location: self.last_location,
        }
    }
}

/// The consolidated view pushed to realtime subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub actions: Vec<Action>,
    pub contacts: Vec<TrustedContact>,
    pub last_location: Option<LocationPing>,
}
