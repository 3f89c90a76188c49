//! Database module for kube-assist
//!
//! Provides persistence for chat sessions and their turns.

mod schema;

pub use schema::*;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Content written for a tool call whose execution never reported back
pub const INTERRUPTED_TOOL_OUTPUT: &str = "[Tool execution interrupted]";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Session Operations ====================

    /// Create a new session with the placeholder title
    pub fn create_session(&self, id: &str, owner: &str) -> DbResult<Session> {
        let conn = self.lock()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO sessions (id, owner, title, title_generated, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![id, owner, PLACEHOLDER_TITLE, to_timestamp(&now)],
        )?;

        Ok(Session {
            id: id.to_string(),
            owner: owner.to_string(),
            title: PLACEHOLDER_TITLE.to_string(),
            title_generated: false,
            created_at: now,
            updated_at: now,
            turn_count: 0,
        })
    }

    /// Get session by ID
    pub fn get_session(&self, id: &str) -> DbResult<Session> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.owner, s.title, s.title_generated, s.created_at, s.updated_at,
                    (SELECT COUNT(*) FROM turns t WHERE t.session_id = s.id) as turn_count
             FROM sessions s WHERE s.id = ?1",
        )?;

        stmt.query_row(params![id], parse_session_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    /// List sessions, most recently updated first
    pub fn list_sessions(&self) -> DbResult<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.owner, s.title, s.title_generated, s.created_at, s.updated_at,
                    (SELECT COUNT(*) FROM turns t WHERE t.session_id = s.id) as turn_count
             FROM sessions s
             ORDER BY s.updated_at DESC, s.created_at DESC",
        )?;

        let rows = stmt.query_map([], parse_session_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Replace the placeholder title. Returns `false` if a generated title
    /// was already set, leaving it untouched.
    pub fn rename_once(&self, id: &str, title: &str) -> DbResult<bool> {
        let conn = self.lock()?;
        let now = Utc::now();

        let updated = conn.execute(
            "UPDATE sessions SET title = ?1, title_generated = 1, updated_at = ?2
             WHERE id = ?3 AND title_generated = 0",
            params![title, to_timestamp(&now), id],
        )?;

        if updated == 0 {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(DbError::SessionNotFound(id.to_string()));
            }
        }
        Ok(updated > 0)
    }

    /// Repair every transcript where an assistant tool call has no tool turn
    /// answering it, typically left behind by a crash mid-execution.
    ///
    /// Returns the number of synthetic tool turns inserted.
    pub fn repair_orphaned_tool_calls(&self) -> DbResult<usize> {
        let conn = self.lock()?;
        let now = Utc::now();

        let mut session_stmt = conn.prepare("SELECT id FROM sessions")?;
        let session_ids: Vec<String> = session_stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut repaired = 0;
        for session_id in session_ids {
            let turns = select_turns(&conn, &session_id)?;

            let mut pending: Vec<String> = Vec::new();
            let mut last_sequence = 0;
            for turn in &turns {
                last_sequence = turn.sequence_id;
                match turn.role {
                    TurnRole::Assistant => {
                        pending.extend(turn.tool_calls.iter().map(|c| c.id.clone()));
                    }
                    TurnRole::Tool => {
                        if let Some(id) = &turn.tool_call_id {
                            pending.retain(|p| p != id);
                        }
                    }
                    TurnRole::System | TurnRole::User => {}
                }
            }

            for tool_call_id in pending {
                last_sequence += 1;
                insert_turn(
                    &conn,
                    &session_id,
                    last_sequence,
                    &NewTurn::tool(&tool_call_id, INTERRUPTED_TOOL_OUTPUT),
                    &now,
                )?;
                repaired += 1;

                tracing::info!(
                    session_id = %session_id,
                    tool_call_id = %tool_call_id,
                    "Injected synthetic tool turn for orphaned tool call"
                );
            }
        }

        Ok(repaired)
    }

    // ==================== Turn Operations ====================

    /// Append a turn to a session, assigning the next sequence ID
    pub fn append_turn(&self, session_id: &str, turn: &NewTurn) -> DbResult<Turn> {
        let conn = self.lock()?;
        let now = Utc::now();

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
            params![session_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DbError::SessionNotFound(session_id.to_string()));
        }

        let sequence_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM turns WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        let stored = insert_turn(&conn, session_id, sequence_id, turn, &now)?;

        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![to_timestamp(&now), session_id],
        )?;

        Ok(stored)
    }

    /// Get all turns of a session in sequence order
    pub fn get_turns(&self, session_id: &str) -> DbResult<Vec<Turn>> {
        let conn = self.lock()?;
        select_turns(&conn, session_id)
    }
}

fn insert_turn(
    conn: &Connection,
    session_id: &str,
    sequence_id: i64,
    turn: &NewTurn,
    now: &DateTime<Utc>,
) -> DbResult<Turn> {
    let turn_id = uuid::Uuid::new_v4().to_string();
    let tool_calls = if turn.tool_calls.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&turn.tool_calls).unwrap_or_else(|_| "[]".to_string()))
    };

    conn.execute(
        "INSERT INTO turns (turn_id, session_id, sequence_id, role, content, tool_calls, tool_call_id, incomplete, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            turn_id,
            session_id,
            sequence_id,
            turn.role.to_string(),
            turn.content,
            tool_calls,
            turn.tool_call_id,
            turn.incomplete,
            to_timestamp(now),
        ],
    )?;

    Ok(Turn {
        turn_id,
        session_id: session_id.to_string(),
        sequence_id,
        role: turn.role,
        content: turn.content.clone(),
        tool_calls: turn.tool_calls.clone(),
        tool_call_id: turn.tool_call_id.clone(),
        incomplete: turn.incomplete,
        created_at: *now,
    })
}

fn select_turns(conn: &Connection, session_id: &str) -> DbResult<Vec<Turn>> {
    let mut stmt = conn.prepare(
        "SELECT turn_id, session_id, sequence_id, role, content, tool_calls, tool_call_id, incomplete, created_at
         FROM turns WHERE session_id = ?1 ORDER BY sequence_id ASC",
    )?;

    let rows = stmt.query_map(params![session_id], parse_turn_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        owner: row.get(1)?,
        title: row.get(2)?,
        title_generated: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
        turn_count: row.get(6)?,
    })
}

/// Parse a turn row from the database
fn parse_turn_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let role_str: String = row.get(3)?;
    let role = TurnRole::parse(&role_str).unwrap_or(TurnRole::System);
    let tool_calls = row
        .get::<_, Option<String>>(5)?
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(Turn {
        turn_id: row.get(0)?,
        session_id: row.get(1)?,
        sequence_id: row.get(2)?,
        role,
        content: row.get(4)?,
        tool_calls,
        tool_call_id: row.get(6)?,
        incomplete: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically
fn to_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
