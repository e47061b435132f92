//! SQLite write-through journal for emergency sessions.
//!
//! Each applied mutation rewrites the session's row with a JSON snapshot.
//! On startup the unresolved rows are read back so a restart never silently
//! ends an emergency.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{now_millis, EmergencySession, SessionStatus};

#[derive(Debug)]
pub enum JournalError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    Poisoned,
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            JournalError::Serde(e) => write!(f, "serialization error: {e}"),
            JournalError::Poisoned => write!(f, "journal lock poisoned"),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<rusqlite::Error> for JournalError {
    fn from(e: rusqlite::Error) -> Self {
        JournalError::Sqlite(e)
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Serde(e)
    }
}

pub struct SessionJournal {
    conn: Mutex<Connection>,
}

impl SessionJournal {
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, JournalError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, JournalError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                owner_id TEXT,
                status TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace the stored snapshot of `session`.
    pub fn save(&self, session: &EmergencySession) -> Result<(), JournalError> {
        let snapshot = serde_json::to_string(session)?;
        let conn = self.conn.lock().map_err(|_| JournalError::Poisoned)?;
        conn.execute(
            "INSERT INTO sessions (session_id, owner_id, status, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                status = excluded.status,
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at",
            params![
                session.id,
                session.owner_id,
                session.status.as_str(),
                snapshot,
                now_millis() as i64
            ],
        )?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<Option<EmergencySession>, JournalError> {
        let conn = self.conn.lock().map_err(|_| JournalError::Poisoned)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every session that has not reached `RESOLVED`, oldest first.
    pub fn load_unresolved(&self) -> Result<Vec<EmergencySession>, JournalError> {
        let conn = self.conn.lock().map_err(|_| JournalError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT snapshot FROM sessions WHERE status != ?1 ORDER BY updated_at ASC",
        )?;
        let rows = stmt.query_map(params![SessionStatus::Resolved.as_str()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(serde_json::from_str(&row?)?);
        }
        Ok(sessions)
    }
}
