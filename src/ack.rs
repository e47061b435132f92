//! Correlates inbound acknowledgements with a session's contact snapshot.
//!
//! Where the acknowledgement came from (SMS reply, delivery callback, ...)
//! does not matter here; the tracker only matches it to a contact and
//! records the first one.

use std::sync::Arc;

use crate::logging;
use crate::store::{MutationOutcome, SessionStore};

/// Which contact is acknowledging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactRef {
    Index(usize),
    Phone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Recorded,
    AlreadyAcknowledged,
    UnknownContact,
    /// Session unknown or resolved.
    Inactive,
}

/// Reduce a phone number to digits, keeping a leading `+`.
pub fn normalize_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if trimmed.starts_with('+') {
        format!("+{digits}")
    } else {
        digits
    }
}

fn same_phone(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_phone(a), normalize_phone(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.trim_start_matches('+') == b.trim_start_matches('+')
}

pub struct AckTracker {
    store: Arc<SessionStore>,
}

impl AckTracker {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, session_id: &str, contact: &ContactRef, at: u64) -> AckOutcome {
        let Some(session) = self.store.get(session_id).await else {
            return AckOutcome::Inactive;
        };
        if session.is_resolved() {
            return AckOutcome::Inactive;
        }

        let index = match contact {
            ContactRef::Index(i) if *i < session.contacts.len() => *i,
            ContactRef::Index(_) => return AckOutcome::UnknownContact,
            ContactRef::Phone(phone) => {
                match session.contacts.iter().position(|c| same_phone(&c.phone, phone)) {
                    Some(i) => i,
                    None => return AckOutcome::UnknownContact,
                }
            }
        };

        match self.store.ack_contact(session_id, index, at).await {
            MutationOutcome::Applied => {
                crate::tlog!(
                    "ack: {} acknowledged {}",
                    logging::contact(index),
                    logging::session_id(session_id)
                );
                AckOutcome::Recorded
            }
            MutationOutcome::Unchanged => AckOutcome::AlreadyAcknowledged,
            MutationOutcome::NotFound => AckOutcome::UnknownContact,
            MutationOutcome::Resolved => AckOutcome::Inactive,
        }
    }
}
