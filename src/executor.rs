//! Drives one action of one session through its retry state machine.
//!
//! ```text
//! queued → running → success
//!             │
//!             └─ attempt failed ─→ retrying ─(backoff)─→ running …
//!                      └─ retries exhausted ─→ failed
//! ```
//!
//! Before every attempt the executor re-reads the session; once it is
//! resolved no further attempt starts.  An attempt already in flight when the
//! session resolves is allowed to finish, but the store refuses to record it.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::capability::{AttemptRequest, Capability};
use crate::config::OrchestratorConfig;
use crate::logging;
use crate::model::{
    now_millis, set_alert_status, ActionKind, ActionState, FailureOutcome, SessionId, SmsStatus,
};
use crate::store::{MutationOutcome, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    /// The session was resolved or vanished before the action finished.
    Abandoned,
}

pub struct ActionExecutor {
    store: Arc<SessionStore>,
    capability: Arc<dyn Capability>,
    config: Arc<OrchestratorConfig>,
    session_id: SessionId,
    kind: ActionKind,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<SessionStore>,
        capability: Arc<dyn Capability>,
        config: Arc<OrchestratorConfig>,
        session_id: SessionId,
        kind: ActionKind,
    ) -> Self {
        Self {
            store,
            capability,
            config,
            session_id,
            kind,
        }
    }

    pub fn spawn(self) -> JoinHandle<ExecutionOutcome> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> ExecutionOutcome {
        let sid = logging::session_id(&self.session_id);
        loop {
            let Some(session) = self.store.get(&self.session_id).await else {
                return ExecutionOutcome::Abandoned;
            };
            if session.is_resolved() {
                crate::tlog!("{} {}: session resolved, no further attempts", sid, self.kind);
                return ExecutionOutcome::Abandoned;
            }
            let Some(action) = session.action(self.kind) else {
                return ExecutionOutcome::Abandoned;
            };
            let attempt = action.retry_count + 1;
            match action.state {
                ActionState::Success => return ExecutionOutcome::Succeeded { attempts: attempt },
                ActionState::Failed => return ExecutionOutcome::Exhausted { attempts: attempt },
                _ => {}
            }

            let request = AttemptRequest::for_session(&session, self.kind, attempt);
            let started = self
                .store
                .mutate_action(&self.session_id, self.kind, |a| {
                    a.begin_attempt(now_millis()).is_ok()
                })
                .await;
            if started != MutationOutcome::Applied {
                crate::tlog!("{} {}: could not start attempt ({:?})", sid, self.kind, started);
                return ExecutionOutcome::Abandoned;
            }

            match self.capability.attempt(&request).await {
                Ok(detail) => {
                    let alerts = self.kind == ActionKind::Sms;
                    let recorded = self
                        .store
                        .mutate_action_with_contacts(&self.session_id, self.kind, |a, contacts| {
                            if a.record_success(now_millis(), &detail).is_err() {
                                return false;
                            }
                            if alerts {
                                set_alert_status(contacts, SmsStatus::Sent);
                            }
                            true
                        })
                        .await;
                    if recorded != MutationOutcome::Applied {
                        crate::tlog!(
                            "{} {}: attempt {} succeeded after resolution, not recorded",
                            sid,
                            self.kind,
                            attempt
                        );
                        return ExecutionOutcome::Abandoned;
                    }
                    crate::tlog!("{} {}: attempt {} succeeded", sid, self.kind, attempt);
                    return ExecutionOutcome::Succeeded { attempts: attempt };
                }
                Err(error) => {
                    let message = error.to_string();
                    let max_retries = self.config.max_retries;
                    let alerts = self.kind == ActionKind::Sms;
                    let mut failure = None;
                    let recorded = self
                        .store
                        .mutate_action_with_contacts(&self.session_id, self.kind, |a, contacts| {
                            let Ok(outcome) = a.record_failure(now_millis(), &message, max_retries)
                            else {
                                return false;
                            };
                            if alerts && outcome == FailureOutcome::Exhausted {
                                set_alert_status(contacts, SmsStatus::Failed);
                            }
                            failure = Some(outcome);
                            true
                        })
                        .await;
                    if recorded != MutationOutcome::Applied {
                        crate::tlog!(
                            "{} {}: attempt {} failed after resolution, not recorded: {}",
                            sid,
                            self.kind,
                            attempt,
                            message
                        );
                        return ExecutionOutcome::Abandoned;
                    }

                    match failure {
                        Some(FailureOutcome::Retry { retry_count }) => {
                            let backoff = self.config.backoff_for(retry_count);
                            crate::tlog!(
                                "{} {}: attempt {} failed, retrying in {}ms: {}",
                                sid,
                                self.kind,
                                attempt,
                                backoff.as_millis(),
                                message
                            );
                            tokio::time::sleep(backoff).await;
                        }
                        Some(FailureOutcome::Exhausted) => {
                            crate::tlog!(
                                "{} {}: attempt {} failed, giving up: {}",
                                sid,
                                self.kind,
                                attempt,
                                message
                            );
                            return ExecutionOutcome::Exhausted { attempts: attempt };
                        }
                        None => return ExecutionOutcome::Abandoned,
                    }
                }
            }
        }
    }
}
