//! Query Executor
//!
//! Runs statements that passed the safety gate against the query database.
//! The connection is opened read-only and additionally pinned with
//! `PRAGMA query_only`, so a gate miss still cannot write.

use crate::error::{AssistantError, ExecutionFailure, Result};
use crate::safety::AcceptedSql;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One result row, column name to value, in select-list order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Set when more rows existed than the row limit allowed
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct QueryExecutor {
    db_path: PathBuf,
    row_limit: usize,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(db_path: impl Into<PathBuf>, row_limit: usize, timeout: Duration) -> Self {
        Self {
            db_path: db_path.into(),
            row_limit,
            timeout,
        }
    }

    pub async fn execute(&self, sql: &AcceptedSql) -> Result<QueryResult> {
        let executor = self.clone();
        let sql = sql.clone();
        tokio::task::spawn_blocking(move || executor.execute_blocking(&sql))
            .await
            .map_err(|e| AssistantError::execution(ExecutionFailure::Database, format!("query task: {}", e)))?
    }

    pub fn execute_blocking(&self, sql: &AcceptedSql) -> Result<QueryResult> {
        let started = Instant::now();
        let conn = self.open()?;

        let deadline = started + self.timeout;
        conn.progress_handler(1000, Some(move || Instant::now() > deadline));

        let mut stmt = conn.prepare(sql.as_str()).map_err(categorize)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = Vec::new();
        let mut truncated = false;
        let mut cursor = stmt.query([]).map_err(categorize)?;
        while let Some(row) = cursor.next().map_err(categorize)? {
            if rows.len() == self.row_limit {
                truncated = true;
                break;
            }
            let mut record = Map::with_capacity(columns.len());
            for (idx, name) in columns.iter().enumerate() {
                let value = row.get_ref(idx).map_err(categorize)?;
                record.insert(name.clone(), to_json(value));
            }
            rows.push(record);
        }

        info!(
            "Query returned {} rows{} in {:?}",
            rows.len(),
            if truncated { " (truncated)" } else { "" },
            started.elapsed()
        );
        debug!("SQL: {}", sql);

        Ok(QueryResult {
            columns,
            rows,
            truncated,
        })
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            AssistantError::execution(
                ExecutionFailure::Database,
                format!("open {}: {}", self.db_path.display(), e),
            )
        })?;
        conn.execute_batch("PRAGMA query_only = ON").map_err(categorize)?;
        Ok(conn)
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("blob:{} bytes", bytes.len())),
    }
}

/// Map a driver error to a failure category, keeping the raw text as detail.
fn categorize(err: rusqlite::Error) -> AssistantError {
    let detail = err.to_string();
    let kind = match err.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => ExecutionFailure::Timeout,
        Some(ErrorCode::ReadOnly) => ExecutionFailure::ReadOnlyViolation,
        _ => {
            let lower = detail.to_lowercase();
            if lower.contains("no such table") {
                ExecutionFailure::MissingTable
            } else if lower.contains("no such column") {
                ExecutionFailure::MissingColumn
            } else if lower.contains("syntax error") || lower.contains("incomplete input") {
                ExecutionFailure::Syntax
            } else if lower.contains("readonly") || lower.contains("read-only") {
                ExecutionFailure::ReadOnlyViolation
            } else {
                ExecutionFailure::Database
            }
        }
    };
    AssistantError::execution(kind, detail)
}
