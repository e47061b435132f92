//! GPS ping intake: validation, per-session throttle, append.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::logging;
use crate::model::{now_millis, LocationPing, SessionId};
use crate::store::{MutationOutcome, SessionStore};

/// Ping payload as sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PingInput {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Latitude(f64),
    Longitude(f64),
    Accuracy(f64),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Latitude(v) => write!(f, "latitude out of range: {v}"),
            ValidationError::Longitude(v) => write!(f, "longitude out of range: {v}"),
            ValidationError::Accuracy(v) => write!(f, "invalid accuracy: {v}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl PingInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(ValidationError::Latitude(self.lat));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(ValidationError::Longitude(self.lng));
        }
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(ValidationError::Accuracy(self.accuracy));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Arrived inside the minimum interval since the last accepted ping.
    Throttled,
    /// Session unknown or resolved.
    Inactive,
}

pub struct LocationIngestor {
    store: Arc<SessionStore>,
    min_interval: Duration,
    last_accepted: Mutex<HashMap<SessionId, Instant>>,
}

impl LocationIngestor {
    pub fn new(store: Arc<SessionStore>, min_interval: Duration) -> Self {
        Self {
            store,
            min_interval,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record(
        &self,
        session_id: &str,
        input: PingInput,
    ) -> Result<IngestOutcome, ValidationError> {
        self.record_at(session_id, input, Instant::now(), now_millis())
            .await
    }

    /// Like [`record`](Self::record) with explicit receive instant and
    /// timestamp.
    pub async fn record_at(
        &self,
        session_id: &str,
        input: PingInput,
        received: Instant,
        timestamp: u64,
    ) -> Result<IngestOutcome, ValidationError> {
        input.validate()?;

        // Reserve the slot, then append without holding the map lock.
        let previous = {
            let mut last_accepted = self.last_accepted.lock().await;
            if let Some(last) = last_accepted.get(session_id) {
                if received.saturating_duration_since(*last) < self.min_interval {
                    return Ok(IngestOutcome::Throttled);
                }
            }
            last_accepted.insert(session_id.to_string(), received)
        };

        let ping = LocationPing {
            lat: input.lat,
            lng: input.lng,
            accuracy: input.accuracy,
            timestamp,
        };
        let outcome = self.store.append_ping(session_id, ping).await;
        if outcome.is_applied() {
            return Ok(IngestOutcome::Accepted);
        }

        self.release(session_id, received, previous, outcome).await;
        if outcome != MutationOutcome::Resolved {
            crate::tlog!(
                "ingest: dropped ping for unknown {}",
                logging::session_id(session_id)
            );
        }
        Ok(IngestOutcome::Inactive)
    }

    /// Undo a reservation whose append did not land.  A later ping that
    /// already replaced the slot keeps it.
    async fn release(
        &self,
        session_id: &str,
        reserved: Instant,
        previous: Option<Instant>,
        outcome: MutationOutcome,
    ) {
        let mut last_accepted = self.last_accepted.lock().await;
        if last_accepted.get(session_id) != Some(&reserved) {
            return;
        }
        match (outcome, previous) {
            (MutationOutcome::Resolved, _) | (_, None) => {
                last_accepted.remove(session_id);
            }
            (_, Some(previous)) => {
                last_accepted.insert(session_id.to_string(), previous);
            }
        }
    }

    /// Drop throttle state for a finished session.
    pub async fn forget(&self, session_id: &str) {
        self.last_accepted.lock().await.remove(session_id);
    }
}
