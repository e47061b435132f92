//! Realtime fan-out of session changes to joined connections.
//!
//! Every realtime connection registers once and gets its own bounded outbound
//! queue.  Connections then join or leave session rooms; a published event is
//! pushed to every connection in the room.  Room membership is process-local
//! and starts empty on every start: connections are never persisted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

use crate::logging;
use crate::model::{LocationPing, SessionId, SessionSnapshot};

pub type ConnectionId = u64;

/// Outbound queue depth per connection.  A client that falls this far behind
/// misses events until it drains; the next snapshot brings it current.
pub const CONNECTION_QUEUE_CAPACITY: usize = 64;

/// Events sent server → client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session:update")]
    SessionUpdate(SessionSnapshot),
    #[serde(rename = "location:update")]
    LocationUpdate(LocationUpdate),
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub session_id: SessionId,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub timestamp: u64,
}

impl LocationUpdate {
    pub fn new(session_id: &str, ping: &LocationPing) -> Self {
        Self {
            session_id: session_id.to_string(),
            lat: ping.lat,
            lng: ping.lng,
            accuracy: ping.accuracy,
            timestamp: ping.timestamp,
        }
    }
}

#[derive(Default)]
struct Rooms {
    rooms: HashMap<SessionId, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
    next_conn_id: ConnectionId,
}

impl Rooms {
    fn remove_connection(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
        self.rooms.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
    }
}

#[derive(Clone, Default)]
pub struct Broadcaster {
    inner: Arc<Mutex<Rooms>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back its id and outbound queue.
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let mut inner = self.inner.lock().await;
        let id = inner.next_conn_id;
        inner.next_conn_id += 1;
        inner.connections.insert(id, tx);
        (id, rx)
    }

    /// Returns false when the connection is unknown (already disconnected).
    pub async fn join(&self, conn: ConnectionId, session_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.connections.contains_key(&conn) {
            return false;
        }
        inner
            .rooms
            .entry(session_id.to_string())
            .or_default()
            .insert(conn);
        crate::tlog!(
            "broadcast: {} joined {}",
            logging::connection_id(conn),
            logging::session_id(session_id)
        );
        true
    }

    pub async fn leave(&self, conn: ConnectionId, session_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(members) = inner.rooms.get_mut(session_id) else {
            return false;
        };
        let removed = members.remove(&conn);
        if members.is_empty() {
            inner.rooms.remove(session_id);
        }
        removed
    }

    /// Drop a connection from every room.  Session lifecycles are untouched.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock().await;
        inner.remove_connection(conn);
        crate::tlog!("broadcast: {} disconnected", logging::connection_id(conn));
    }

    /// Push an event to one connection, e.g. the snapshot sent on join.
    pub async fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(tx) = inner.connections.get(&conn) else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                inner.remove_connection(conn);
                false
            }
        }
    }

    /// Push an event to every connection joined to `session_id`.  Returns the
    /// number of connections it was queued for.
    pub async fn publish(&self, session_id: &str, event: ServerEvent) -> usize {
        let mut inner = self.inner.lock().await;
        let Some(members) = inner.rooms.get(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for conn in members {
            let Some(tx) = inner.connections.get(conn) else {
                closed.push(*conn);
                continue;
            };
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    crate::tlog!(
                        "broadcast: {} lagging, dropped event for {}",
                        logging::connection_id(*conn),
                        logging::session_id(session_id)
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*conn),
            }
        }

        for conn in closed {
            inner.remove_connection(conn);
        }
        delivered
    }

    pub async fn room_size(&self, session_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.rooms.get(session_id).map(HashSet::len).unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }
}
