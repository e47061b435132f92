//! Authoritative in-memory state of every emergency session.
//!
//! The store is the only writer of session state.  Each session sits behind
//! its own async mutex, so all mutations of one session are linearized while
//! different sessions proceed independently.  Every applied mutation is
//! journaled (when a journal is configured) and published to the
//! [`Broadcaster`] before the session lock is released, so subscribers see
//! changes in the order they were made.
//!
//! Mutations against a `RESOLVED` session are absorbed: they return
//! [`MutationOutcome::Resolved`] and change nothing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::broadcast::{Broadcaster, LocationUpdate, ServerEvent};
use crate::journal::{JournalError, SessionJournal};
use crate::logging;
use crate::model::{
    now_millis, set_alert_status, Action, ActionKind, EmergencySession, LocationPing, SessionId,
    SessionSnapshot, SessionStatus, SmsStatus, TrustedContact,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// The request was valid but left state as it was.
    Unchanged,
    /// The session is resolved; nothing was changed.
    Resolved,
    NotFound,
}

impl MutationOutcome {
    pub fn is_applied(self) -> bool {
        self == MutationOutcome::Applied
    }
}

type SessionCell = Arc<Mutex<EmergencySession>>;

pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SessionCell>>,
    /// Owner → their current non-resolved session.
    owners: Mutex<HashMap<String, SessionId>>,
    broadcaster: Broadcaster,
    journal: Option<SessionJournal>,
    ping_history: usize,
}

impl SessionStore {
    pub fn new(broadcaster: Broadcaster, ping_history: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            broadcaster,
            journal: None,
            ping_history,
        }
    }

    pub fn with_journal(mut self, journal: SessionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    async fn cell(&self, session_id: &str) -> Option<SessionCell> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Journal and publish a full snapshot.  Callers hold the session lock.
    async fn commit(&self, session: &EmergencySession) {
        self.persist(session);
        self.broadcaster
            .publish(&session.id, ServerEvent::SessionUpdate(session.snapshot()))
            .await;
    }

    fn persist(&self, session: &EmergencySession) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save(session) {
                crate::tlog!(
                    "store: journal write failed for {}: {}",
                    logging::session_id(&session.id),
                    e
                );
            }
        }
    }

    async fn insert(&self, session: EmergencySession) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return false;
        }
        let id = session.id.clone();
        let cell = Arc::new(Mutex::new(session));
        {
            let session = cell.lock().await;
            self.commit(&session).await;
        }
        sessions.insert(id, cell);
        true
    }

    /// Insert a new session.  Returns false if the id is already taken.
    pub async fn create(&self, session: EmergencySession) -> bool {
        let owner = session.owner_id.clone();
        let id = session.id.clone();
        if !self.insert(session).await {
            return false;
        }
        if let Some(owner) = owner {
            self.owners.lock().await.insert(owner, id);
        }
        true
    }

    /// Return the owner's live session, or create one with `build`.
    ///
    /// The owner index lock is held across the check and the insert, so two
    /// concurrent triggers for one owner end up with the same session.
    /// Anonymous callers always get a new session.  The flag is true when a
    /// session was created.
    pub async fn create_or_get<F>(&self, owner_id: Option<&str>, build: F) -> (EmergencySession, bool)
    where
        F: FnOnce() -> EmergencySession,
    {
        let Some(owner) = owner_id else {
            let session = build();
            let copy = session.clone();
            self.insert(session).await;
            return (copy, true);
        };

        let mut owners = self.owners.lock().await;
        if let Some(existing_id) = owners.get(owner) {
            if let Some(cell) = self.cell(existing_id).await {
                let existing = cell.lock().await;
                if !existing.is_resolved() {
                    return (existing.clone(), false);
                }
            }
        }

        let session = build();
        let copy = session.clone();
        owners.insert(owner.to_string(), session.id.clone());
        self.insert(session).await;
        (copy, true)
    }

    /// Put a journaled session back without re-publishing it.
    pub async fn restore(&self, session: EmergencySession) -> bool {
        let id = session.id.clone();
        let live_owner = match session.is_resolved() {
            false => session.owner_id.clone(),
            true => None,
        };
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                return false;
            }
            sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        }
        if let Some(owner) = live_owner {
            self.owners.lock().await.insert(owner, id);
        }
        true
    }

    /// Load unresolved sessions from the journal into the store.  Interrupted
    /// attempts are requeued.  Returns the restored sessions.
    pub async fn recover(&self) -> Result<Vec<EmergencySession>, JournalError> {
        let Some(journal) = &self.journal else {
            return Ok(Vec::new());
        };
        let now = now_millis();
        let mut restored = Vec::new();
        for mut session in journal.load_unresolved()? {
            for action in session.actions.iter_mut() {
                action.requeue_interrupted(now);
            }
            self.persist(&session);
            if self.restore(session.clone()).await {
                restored.push(session);
            }
        }
        Ok(restored)
    }

    /// Apply `mutate` to a live session.  The closure reports whether it
    /// changed anything.
    async fn apply<F>(&self, session_id: &str, what: &str, mutate: F) -> MutationOutcome
    where
        F: FnOnce(&mut EmergencySession) -> Option<bool>,
    {
        let Some(cell) = self.cell(session_id).await else {
            return MutationOutcome::NotFound;
        };
        let mut session = cell.lock().await;
        if session.is_resolved() {
            crate::tlog!(
                "store: ignored {} on resolved {}",
                what,
                logging::session_id(session_id)
            );
            return MutationOutcome::Resolved;
        }
        match mutate(&mut *session) {
            None => MutationOutcome::NotFound,
            Some(false) => MutationOutcome::Unchanged,
            Some(true) => {
                self.commit(&session).await;
                MutationOutcome::Applied
            }
        }
    }

    /// Apply `transform` to one action.  The transform returns whether it
    /// changed the action.
    pub async fn mutate_action<F>(
        &self,
        session_id: &str,
        kind: ActionKind,
        transform: F,
    ) -> MutationOutcome
    where
        F: FnOnce(&mut Action) -> bool,
    {
        self.mutate_action_with_contacts(session_id, kind, |action, _| transform(action))
            .await
    }

    /// Like [`mutate_action`](Self::mutate_action), with the contact list
    /// alongside.  Both land in one snapshot.
    pub async fn mutate_action_with_contacts<F>(
        &self,
        session_id: &str,
        kind: ActionKind,
        transform: F,
    ) -> MutationOutcome
    where
        F: FnOnce(&mut Action, &mut [TrustedContact]) -> bool,
    {
        self.apply(session_id, kind.as_str(), |session| {
            let action = session.actions.iter_mut().find(|a| a.kind == kind)?;
            Some(transform(action, &mut session.contacts))
        })
        .await
    }

    /// Append a ping.  Publishes a `location:update` rather than a full
    /// snapshot.
    pub async fn append_ping(&self, session_id: &str, ping: LocationPing) -> MutationOutcome {
        let Some(cell) = self.cell(session_id).await else {
            return MutationOutcome::NotFound;
        };
        let mut session = cell.lock().await;
        if session.is_resolved() {
            crate::tlog!(
                "store: ignored ping on resolved {}",
                logging::session_id(session_id)
            );
            return MutationOutcome::Resolved;
        }
        session.push_ping(ping, self.ping_history);
        self.persist(&session);
        self.broadcaster
            .publish(
                session_id,
                ServerEvent::LocationUpdate(LocationUpdate::new(session_id, &ping)),
            )
            .await;
        MutationOutcome::Applied
    }

    /// Record the first acknowledgement of contact `index`.
    pub async fn ack_contact(&self, session_id: &str, index: usize, at: u64) -> MutationOutcome {
        self.apply(session_id, "ack", |session| {
            let contact = session.contacts.get_mut(index)?;
            if contact.ack_at.is_some() {
                return Some(false);
            }
            contact.ack_at = Some(at);
            Some(true)
        })
        .await
    }

    /// Set the alert status of every alertable contact.
    pub async fn update_sms_status(&self, session_id: &str, status: SmsStatus) -> MutationOutcome {
        self.apply(session_id, "sms status", |session| {
            Some(set_alert_status(&mut session.contacts, status))
        })
        .await
    }

    /// Move the session status forward.  Resolving stamps `resolved_at` and
    /// frees the owner to trigger again.
    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> MutationOutcome {
        let mut owner = None;
        let outcome = self
            .apply(session_id, "status change", |session| {
                if !session.status.can_transition_to(status) {
                    return Some(false);
                }
                session.status = status;
                if status == SessionStatus::Resolved {
                    session.resolved_at = Some(now_millis());
                    owner = session.owner_id.clone();
                }
                Some(true)
            })
            .await;

        if let Some(owner) = owner {
            let mut owners = self.owners.lock().await;
            if owners.get(&owner).map(String::as_str) == Some(session_id) {
                owners.remove(&owner);
            }
        }
        outcome
    }

    pub async fn get(&self, session_id: &str) -> Option<EmergencySession> {
        let cell = self.cell(session_id).await?;
        let session = cell.lock().await;
        Some(session.clone())
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let cell = self.cell(session_id).await?;
        let session = cell.lock().await;
        Some(session.snapshot())
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        let cell = self.cell(session_id).await?;
        let status = cell.lock().await.status;
        Some(status)
    }

    /// The owner's current non-resolved session, if any.
    pub async fn active_session_for(&self, owner_id: &str) -> Option<SessionId> {
        self.owners.lock().await.get(owner_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ids of every session that is not resolved.
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let cells: Vec<(SessionId, SessionCell)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, cell)| (id.clone(), Arc::clone(cell)))
            .collect();
        let mut active = Vec::new();
        for (id, cell) in cells {
            if cell.lock().await.status.is_live() {
                active.push(id);
            }
        }
        active
    }
}
