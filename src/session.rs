//! Conversation State
//!
//! Ordered per-session turn history behind the `SessionStore` trait, with an
//! in-memory backend and a SQLite backend (`chat_history.db`). Both apply the
//! same eviction policy: a max-turns cap on append and a TTL since last
//! activity applied by `evict_expired`.

use crate::config::{SessionBackend, SessionConfig};
use crate::error::{AssistantError, Result};
use crate::executor::{QueryResult, Row};
use crate::safety::AcceptedSql;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(AssistantError::Storage(format!("unknown role '{}'", other))),
        }
    }
}

/// One message in a session. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
    #[serde(skip)]
    rows: Option<Vec<Row>>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into(), None, None)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into(), None, None)
    }

    /// Assistant turn that records a query which passed the gate.
    pub fn assistant_with_query(
        content: impl Into<String>,
        sql: &AcceptedSql,
        result: &QueryResult,
    ) -> Self {
        Self::new(
            Role::Assistant,
            content.into(),
            Some(sql.as_str().to_string()),
            Some(result.rows.clone()),
        )
    }

    fn new(role: Role, content: String, sql: Option<String>, rows: Option<Vec<Row>>) -> Self {
        Self {
            role,
            content,
            sql,
            rows,
            created_at: Utc::now(),
        }
    }

    /// Rebuild a stored turn. Only the store may do this, since the SQL it
    /// carries was gated when the turn was first appended.
    pub(crate) fn restore(
        role: Role,
        content: String,
        sql: Option<String>,
        rows: Option<Vec<Row>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            role,
            content,
            sql,
            rows,
            created_at,
        }
    }

    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn rows(&self) -> Option<&[Row]> {
        self.rows.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub first_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub turn_count: usize,
}

pub trait SessionStore: Send + Sync {
    /// Append a turn, creating the session on first use.
    fn append(&self, session_id: &str, turn: Turn) -> Result<()>;

    /// Turns of a session in insertion order; empty for unknown sessions.
    fn history(&self, session_id: &str) -> Result<Vec<Turn>>;

    /// All sessions, most recently created first.
    fn sessions(&self) -> Result<Vec<SessionSummary>>;

    /// Drop sessions idle for longer than `ttl`. Returns how many were removed.
    fn evict_expired(&self, ttl: Duration) -> Result<usize>;
}

/// Open the store selected by the configuration.
pub fn open_store(config: &SessionConfig) -> Result<Arc<dyn SessionStore>> {
    match &config.backend {
        SessionBackend::Memory => {
            info!("Using in-memory session store");
            Ok(Arc::new(InMemorySessionStore::new(config.max_turns)))
        }
        SessionBackend::Sqlite(path) => {
            info!("Using SQLite session store at {}", path.display());
            Ok(Arc::new(SqliteSessionStore::open(path, config.max_turns)?))
        }
    }
}

fn cutoff(ttl: Duration) -> Result<Option<DateTime<Utc>>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| AssistantError::Storage(format!("session TTL out of range: {}", e)))?;
    Ok(Utc::now().checked_sub_signed(ttl))
}

struct SessionEntry {
    first_message: Option<String>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    turns: VecDeque<Turn>,
}

pub struct InMemorySessionStore {
    max_turns: usize,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl InMemorySessionStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SessionEntry>>> {
        self.sessions
            .lock()
            .map_err(|_| AssistantError::Storage("session map lock poisoned".to_string()))
    }
}

impl SessionStore for InMemorySessionStore {
    fn append(&self, session_id: &str, turn: Turn) -> Result<()> {
        let mut sessions = self.lock()?;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                first_message: None,
                created_at: turn.created_at,
                last_active: turn.created_at,
                turns: VecDeque::new(),
            });

        if entry.first_message.is_none() && turn.role == Role::User {
            entry.first_message = Some(turn.content.clone());
        }
        entry.last_active = turn.created_at;
        entry.turns.push_back(turn);
        while self.max_turns > 0 && entry.turns.len() > self.max_turns {
            entry.turns.pop_front();
        }
        Ok(())
    }

    fn history(&self, session_id: &str) -> Result<Vec<Turn>> {
        Ok(self
            .lock()?
            .get(session_id)
            .map(|entry| entry.turns.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> = self
            .lock()?
            .iter()
            .map(|(id, entry)| SessionSummary {
                session_id: id.clone(),
                first_message: entry.first_message.clone(),
                created_at: entry.created_at,
                turn_count: entry.turns.len(),
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    fn evict_expired(&self, ttl: Duration) -> Result<usize> {
        let Some(cutoff) = cutoff(ttl)? else {
            return Ok(0);
        };
        let mut sessions = self.lock()?;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_active >= cutoff);
        Ok(before - sessions.len())
    }
}

/// Persistent store backed by a SQLite file.
pub struct SqliteSessionStore {
    max_turns: usize,
    db: Mutex<Connection>,
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| AssistantError::Storage(format!("bad timestamp '{}': {}", raw, e)))
}

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>, max_turns: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| AssistantError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;
        Self::with_connection(db, max_turns)
    }

    pub fn with_connection(db: Connection, max_turns: usize) -> Result<Self> {
        let store = Self {
            max_turns,
            db: Mutex::new(db),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| AssistantError::Storage("session database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                session_id TEXT PRIMARY KEY,
                first_message TEXT,
                created_at TEXT NOT NULL,
                last_active TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sql TEXT,
                rows TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON conversation_messages(session_id, id);
            "#,
        )?;
        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    fn append(&self, session_id: &str, turn: Turn) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let at = timestamp(&turn.created_at);

        tx.execute(
            "INSERT INTO chat_sessions (session_id, first_message, created_at, last_active)
             VALUES (?1, NULL, ?2, ?2)
             ON CONFLICT(session_id) DO UPDATE SET last_active = excluded.last_active",
            params![session_id, at],
        )?;
        if turn.role == Role::User {
            tx.execute(
                "UPDATE chat_sessions SET first_message = ?2
                 WHERE session_id = ?1 AND first_message IS NULL",
                params![session_id, turn.content],
            )?;
        }

        let rows = turn.rows.as_ref().map(serde_json::to_string).transpose()?;
        tx.execute(
            "INSERT INTO conversation_messages (session_id, role, content, sql, rows, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, turn.role.as_str(), turn.content, turn.sql, rows, at],
        )?;

        if self.max_turns > 0 {
            let trimmed = tx.execute(
                "DELETE FROM conversation_messages WHERE session_id = ?1 AND id NOT IN (
                     SELECT id FROM conversation_messages WHERE session_id = ?1
                     ORDER BY id DESC LIMIT ?2)",
                params![session_id, self.max_turns as i64],
            )?;
            if trimmed > 0 {
                debug!("Trimmed {} old turns from session {}", trimmed, session_id);
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn history(&self, session_id: &str) -> Result<Vec<Turn>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT role, content, sql, rows, created_at FROM conversation_messages
             WHERE session_id = ?1 ORDER BY id",
        )?;
        let raw = stmt
            .query_map([session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(role, content, sql, rows, created_at)| -> Result<Turn> {
                let rows = rows
                    .map(|text| serde_json::from_str::<Vec<Row>>(&text))
                    .transpose()?;
                Ok(Turn::restore(
                    Role::parse(&role)?,
                    content,
                    sql,
                    rows,
                    parse_timestamp(&created_at)?,
                ))
            })
            .collect()
    }

    fn sessions(&self) -> Result<Vec<SessionSummary>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT s.session_id, s.first_message, s.created_at,
                    (SELECT COUNT(*) FROM conversation_messages m WHERE m.session_id = s.session_id)
             FROM chat_sessions s
             ORDER BY s.created_at DESC, s.rowid DESC",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(session_id, first_message, created_at, count)| -> Result<SessionSummary> {
                Ok(SessionSummary {
                    session_id,
                    first_message,
                    created_at: parse_timestamp(&created_at)?,
                    turn_count: count as usize,
                })
            })
            .collect()
    }

    fn evict_expired(&self, ttl: Duration) -> Result<usize> {
        let Some(cutoff) = cutoff(ttl)? else {
            return Ok(0);
        };
        let cutoff = timestamp(&cutoff);

        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM conversation_messages WHERE session_id IN (
                 SELECT session_id FROM chat_sessions WHERE last_active < ?1)",
            [&cutoff],
        )?;
        let removed = tx.execute("DELETE FROM chat_sessions WHERE last_active < ?1", [&cutoff])?;
        tx.commit()?;
        Ok(removed)
    }
}

/// Per-session request locks. Holding the guard serializes every request for
/// one session while other sessions proceed.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&*self.locks.entry(session_id.to_string()).or_default());
        lock.lock_owned().await
    }

    /// Drop the lock for a session nobody is waiting on.
    pub fn release_idle(&self, session_id: &str) {
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
