//! Session lifecycle: trigger, cancel, safe screen, and resume after restart.
//!
//! The orchestrator never touches session state itself.  It asks the
//! [`SessionStore`] for every change and hands each action to its own
//! [`ActionExecutor`] task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::ack::{AckOutcome, AckTracker, ContactRef};
use crate::capability::Capabilities;
use crate::config::OrchestratorConfig;
use crate::directory::{hash_pin, verify_pin, IdentityDirectory};
use crate::executor::{ActionExecutor, ExecutionOutcome};
use crate::ingest::{IngestOutcome, LocationIngestor, PingInput, ValidationError};
use crate::journal::JournalError;
use crate::logging;
use crate::model::{
    new_session_id, now_millis, Action, EmergencySession, RiskLevel, SessionId, SessionStatus,
};
use crate::store::{MutationOutcome, SessionStore};

/// Result of a trigger: enough for the client to render immediately.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub session_id: SessionId,
    pub actions: Vec<Action>,
    /// False when an existing live session was returned.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
    /// Covers wrong PIN, unknown session and missing PIN alike.
    InvalidPin,
}

impl std::fmt::Display for CancelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelError::InvalidPin => write!(f, "invalid PIN"),
        }
    }
}

impl std::error::Error for CancelError {}

pub struct Orchestrator {
    store: Arc<SessionStore>,
    directory: Arc<dyn IdentityDirectory>,
    capabilities: Capabilities,
    config: Arc<OrchestratorConfig>,
    ingestor: LocationIngestor,
    acks: AckTracker,
    /// Digest accepted when cancelling an anonymous session.
    anonymous_pin_digest: Option<String>,
    executors: Mutex<HashMap<SessionId, Vec<JoinHandle<ExecutionOutcome>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        directory: Arc<dyn IdentityDirectory>,
        capabilities: Capabilities,
        config: OrchestratorConfig,
    ) -> Self {
        let ingestor = LocationIngestor::new(Arc::clone(&store), config.location_interval);
        let acks = AckTracker::new(Arc::clone(&store));
        Self {
            store,
            directory,
            capabilities,
            config: Arc::new(config),
            ingestor,
            acks,
            anonymous_pin_digest: None,
            executors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_anonymous_pin(mut self, pin: &str) -> Self {
        self.anonymous_pin_digest = Some(hash_pin(pin));
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn IdentityDirectory> {
        &self.directory
    }

    /// Create the owner's session, or return the live one they already have.
    pub async fn trigger(&self, owner_id: Option<&str>, risk_level: RiskLevel) -> TriggerOutcome {
        let contacts = match owner_id {
            Some(owner) => self.directory.trusted_contacts(owner).await,
            None => Vec::new(),
        };

        let (session, created) = self
            .store
            .create_or_get(owner_id, || {
                EmergencySession::new(
                    new_session_id(),
                    owner_id.map(str::to_string),
                    risk_level,
                    contacts,
                    now_millis(),
                )
            })
            .await;

        if created {
            crate::tlog!(
                "trigger: {} opened {} (risk {}, {} contact(s))",
                logging::owner_id(owner_id),
                logging::session_id(&session.id),
                risk_level,
                session.contacts.len()
            );
            self.launch(&session).await;
        } else {
            crate::tlog!(
                "trigger: {} already has {}, returning it",
                logging::owner_id(owner_id),
                logging::session_id(&session.id)
            );
        }

        TriggerOutcome {
            session_id: session.id,
            actions: session.actions,
            created,
        }
    }

    /// Start an executor for every action that has not finished.
    async fn launch(&self, session: &EmergencySession) {
        let mut handles = Vec::new();
        for action in &session.actions {
            if action.state.is_terminal() {
                continue;
            }
            let executor = ActionExecutor::new(
                Arc::clone(&self.store),
                self.capabilities.for_kind(action.kind),
                Arc::clone(&self.config),
                session.id.clone(),
                action.kind,
            );
            handles.push(executor.spawn());
        }

        let mut executors = self.executors.lock().await;
        executors.retain(|_, running| running.iter().any(|h| !h.is_finished()));
        executors.insert(session.id.clone(), handles);
    }

    /// Resolve the session if `pin` matches the owner's safety PIN.
    pub async fn cancel(&self, session_id: &str, pin: &str) -> Result<(), CancelError> {
        let session = self.store.get(session_id).await;
        let digest = match session.as_ref().map(|s| s.owner_id.as_deref()) {
            Some(Some(owner)) => self.directory.pin_digest(owner).await,
            Some(None) => self.anonymous_pin_digest.clone(),
            None => None,
        };
        // Hash even when there is nothing to compare against.
        let matches = match digest {
            Some(digest) => verify_pin(pin, &digest),
            None => {
                let _ = hash_pin(pin);
                false
            }
        };
        if !matches {
            crate::tlog!("cancel: rejected for {}", logging::session_id(session_id));
            return Err(CancelError::InvalidPin);
        }

        match self.store.set_status(session_id, SessionStatus::Resolved).await {
            MutationOutcome::Applied => {
                crate::tlog!("cancel: {} resolved", logging::session_id(session_id));
            }
            MutationOutcome::Resolved => {
                crate::tlog!("cancel: {} was already resolved", logging::session_id(session_id));
            }
            MutationOutcome::NotFound | MutationOutcome::Unchanged => {
                return Err(CancelError::InvalidPin);
            }
        }
        self.ingestor.forget(session_id).await;
        Ok(())
    }

    /// Flip between `ACTIVE` and `SAFE_SCREEN`.
    pub async fn set_safe_screen(&self, session_id: &str, enabled: bool) -> MutationOutcome {
        let status = if enabled {
            SessionStatus::SafeScreen
        } else {
            SessionStatus::Active
        };
        self.store.set_status(session_id, status).await
    }

    pub async fn record_location(
        &self,
        session_id: &str,
        input: PingInput,
    ) -> Result<IngestOutcome, ValidationError> {
        self.ingestor.record(session_id, input).await
    }

    pub async fn acknowledge(&self, session_id: &str, contact: &ContactRef, at: u64) -> AckOutcome {
        self.acks.record(session_id, contact, at).await
    }

    /// Reload unresolved sessions from the journal and restart their
    /// unfinished actions.  Returns how many sessions were resumed.
    pub async fn resume(&self) -> Result<usize, JournalError> {
        let sessions = self.store.recover().await?;
        for session in &sessions {
            crate::tlog!(
                "resume: {} ({})",
                logging::session_id(&session.id),
                session.status
            );
            self.launch(session).await;
        }
        Ok(sessions.len())
    }

    /// Wait for every executor of `session_id` to finish.
    pub async fn wait_for_executors(&self, session_id: &str) -> Vec<ExecutionOutcome> {
        let handles = self
            .executors
            .lock()
            .await
            .remove(session_id)
            .unwrap_or_default();
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => crate::tlog!(
                    "executor for {} panicked: {}",
                    logging::session_id(session_id),
                    e
                ),
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::capability::ScriptedCapability;
    use crate::directory::{ContactEntry, StaticDirectory};
    use crate::model::{ActionKind, ActionState};

    fn contact(name: &str, phone: &str, is_safe: bool) -> ContactEntry {
        ContactEntry {
            name: name.to_string(),
            phone: phone.to_string(),
            relationship: "friend".to_string(),
            is_safe,
            notes: None,
        }
    }

    fn orchestrator() -> Orchestrator {
        let directory = StaticDirectory::new()
            .with_owner(
                "alice",
                "tok-alice",
                "2468",
                vec![contact("Ana", "+15550001", true), contact("Ben", "+15550002", false)],
            )
            .unwrap();
        let store = Arc::new(SessionStore::new(Broadcaster::new(), 50));
        Orchestrator::new(
            store,
            Arc::new(directory),
            Capabilities::uniform(Arc::new(ScriptedCapability::always_ok())),
            OrchestratorConfig {
                retry_backoff: vec![Duration::from_millis(1)],
                ..OrchestratorConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn trigger_snapshots_contacts_and_runs_actions() {
        let orch = orchestrator();
        let outcome = orch.trigger(Some("alice"), RiskLevel::High).await;
        assert!(outcome.created);
        assert_eq!(outcome.actions.len(), 4);

        let outcomes = orch.wait_for_executors(&outcome.session_id).await;
        assert_eq!(outcomes.len(), 4);
        let session = orch.store().get(&outcome.session_id).await.unwrap();
        assert_eq!(session.contacts.len(), 2);
        assert_eq!(session.risk_level, RiskLevel::High);
        assert!(session
            .actions
            .iter()
            .all(|a| a.state == ActionState::Success));
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_session() {
        let orch = Arc::new(orchestrator());
        let a = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.trigger(Some("alice"), RiskLevel::High).await })
        };
        let b = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.trigger(Some("alice"), RiskLevel::High).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.session_id, b.session_id);
        assert!(a.created ^ b.created);
        assert_eq!(orch.store().session_count().await, 1);
    }

    #[tokio::test]
    async fn anonymous_triggers_are_independent() {
        let orch = orchestrator();
        let a = orch.trigger(None, RiskLevel::Low).await;
        let b = orch.trigger(None, RiskLevel::Low).await;
        assert_ne!(a.session_id, b.session_id);
    }

    #[tokio::test]
    async fn cancel_requires_the_owner_pin() {
        let orch = orchestrator();
        let id = orch.trigger(Some("alice"), RiskLevel::High).await.session_id;

        assert_eq!(orch.cancel(&id, "0000").await, Err(CancelError::InvalidPin));
        assert_eq!(orch.cancel("unknown", "2468").await, Err(CancelError::InvalidPin));
        assert_eq!(orch.store().status(&id).await, Some(SessionStatus::Active));

        assert_eq!(orch.cancel(&id, "2468").await, Ok(()));
        assert_eq!(orch.store().status(&id).await, Some(SessionStatus::Resolved));
        assert_eq!(orch.cancel(&id, "2468").await, Ok(()));

        let again = orch.trigger(Some("alice"), RiskLevel::Medium).await;
        assert!(again.created);
        assert_ne!(again.session_id, id);
    }

    #[tokio::test]
    async fn anonymous_cancel_uses_fallback_pin() {
        let orch = orchestrator();
        let id = orch.trigger(None, RiskLevel::Low).await.session_id;
        assert_eq!(orch.cancel(&id, "2468").await, Err(CancelError::InvalidPin));

        let orch = orchestrator().with_anonymous_pin("9999");
        let id = orch.trigger(None, RiskLevel::Low).await.session_id;
        assert_eq!(orch.cancel(&id, "9999").await, Ok(()));
    }

    #[tokio::test]
    async fn safe_screen_does_not_touch_actions() {
        let orch = orchestrator();
        let id = orch.trigger(Some("alice"), RiskLevel::High).await.session_id;
        orch.wait_for_executors(&id).await;
        let before = orch.store().get(&id).await.unwrap().actions;

        assert!(orch.set_safe_screen(&id, true).await.is_applied());
        assert_eq!(orch.store().status(&id).await, Some(SessionStatus::SafeScreen));
        assert!(orch.set_safe_screen(&id, false).await.is_applied());
        assert_eq!(orch.store().get(&id).await.unwrap().actions, before);
        assert_eq!(
            orch.store()
                .get(&id)
                .await
                .unwrap()
                .action(ActionKind::Sms)
                .unwrap()
                .state,
            ActionState::Success
        );
    }
}
