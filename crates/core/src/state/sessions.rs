//! # Session Storage
//!
//! A session records the intent behind a stretch of work and what came of it.
//! Only one session may be open at a time.

use super::db::{lock, CrucibleDb};
use super::experiments::parse_timestamp;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// A bounded unit of work intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub intent: String,
    /// Experiment active when the session started
    #[serde(default)]
    pub experiment_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accomplished: Option<String>,
    #[serde(default)]
    pub unfinished: Option<String>,
    #[serde(default)]
    pub new_fragility: Option<String>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Closing notes for a session
#[derive(Debug, Clone, Default)]
pub struct SessionNotes {
    pub accomplished: Option<String>,
    pub unfinished: Option<String>,
    pub new_fragility: Option<String>,
}

const SELECT_COLUMNS: &str = "SELECT id, intent, experiment_id, started_at, ended_at, \
     accomplished, unfinished, new_fragility FROM sessions";

/// Manager for session rows
pub struct SessionManager {
    conn: Arc<Mutex<Connection>>,
}

impl SessionManager {
    pub fn new(db: &CrucibleDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Open a new session; fails while another one is open
    pub fn start(&self, intent: &str, experiment_id: Option<i64>) -> Result<Session> {
        let conn = lock(&self.conn)?;

        if let Some(open) = active(&conn)? {
            anyhow::bail!(
                "Session {} is still open ('{}'); end it before starting another",
                open.id,
                open.intent
            );
        }

        conn.execute(
            "INSERT INTO sessions (intent, experiment_id, started_at) VALUES (?1, ?2, ?3)",
            params![intent, experiment_id, Utc::now().to_rfc3339()],
        )
        .context("Failed to start session")?;

        let id = conn.last_insert_rowid();
        tracing::info!(id, intent, "Session started");
        load(&conn, id)
    }

    /// Close the open session with its notes
    pub fn end(&self, notes: &SessionNotes) -> Result<Session> {
        let conn = lock(&self.conn)?;

        let open = active(&conn)?.ok_or_else(|| anyhow::anyhow!("No open session to end"))?;

        conn.execute(
            r#"
            UPDATE sessions
            SET ended_at = ?1, accomplished = ?2, unfinished = ?3, new_fragility = ?4
            WHERE id = ?5 AND ended_at IS NULL
            "#,
            params![
                Utc::now().to_rfc3339(),
                notes.accomplished,
                notes.unfinished,
                notes.new_fragility,
                open.id
            ],
        )
        .context("Failed to end session")?;

        tracing::info!(id = open.id, "Session ended");
        load(&conn, open.id)
    }

    /// The currently open session, if any
    pub fn active(&self) -> Result<Option<Session>> {
        let conn = lock(&self.conn)?;
        active(&conn)
    }

    /// Most recent sessions, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY id DESC LIMIT ?1", SELECT_COLUMNS))?;
        let sessions = stmt
            .query_map(params![limit as i64], row_to_session)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list sessions")?;
        Ok(sessions)
    }
}

fn active(conn: &Connection) -> Result<Option<Session>> {
    conn.query_row(
        &format!(
            "{} WHERE ended_at IS NULL ORDER BY id DESC LIMIT 1",
            SELECT_COLUMNS
        ),
        [],
        row_to_session,
    )
    .optional()
    .context("Failed to query active session")
}

fn load(conn: &Connection, id: i64) -> Result<Session> {
    conn.query_row(
        &format!("{} WHERE id = ?1", SELECT_COLUMNS),
        params![id],
        row_to_session,
    )
    .with_context(|| format!("Session not found: {}", id))
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let started_at: String = row.get(3)?;
    let ended_at: Option<String> = row.get(4)?;

    Ok(Session {
        id: row.get(0)?,
        intent: row.get(1)?,
        experiment_id: row.get(2)?,
        started_at: parse_timestamp(&started_at),
        ended_at: ended_at.as_deref().map(parse_timestamp),
        accomplished: row.get(5)?,
        unfinished: row.get(6)?,
        new_fragility: row.get(7)?,
    })
}
