//! Schema Introspector
//!
//! Reads table and column metadata from the query database so it can be
//! embedded into prompts. The descriptor is cached for a configurable interval.

use crate::error::{AssistantError, ExecutionFailure, Result};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Declared type, empty when the column was declared without one
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

/// Table name to ordered column list, tables sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: Vec<TableSchema>,
}

impl SchemaDescriptor {
    /// Numbered listing used inside prompts.
    pub fn render(&self) -> String {
        if self.tables.is_empty() {
            return "(the database has no tables)\n".to_string();
        }

        let mut out = String::new();
        for (idx, table) in self.tables.iter().enumerate() {
            out.push_str(&format!("{}. {}:\n", idx + 1, table.name));
            for col in &table.columns {
                if col.data_type.is_empty() {
                    out.push_str(&format!("   - {}\n", col.name));
                } else {
                    out.push_str(&format!("   - {} ({})\n", col.name, col.data_type));
                }
            }
        }
        out
    }
}

/// Read the schema of the SQLite file at `path`.
pub fn introspect(path: &Path) -> Result<SchemaDescriptor> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| {
        AssistantError::execution(
            ExecutionFailure::Database,
            format!("open {} for introspection: {}", path.display(), e),
        )
    })?;
    introspect_connection(&conn)
}

pub fn introspect_connection(conn: &Connection) -> Result<SchemaDescriptor> {
    let map_err =
        |e: rusqlite::Error| AssistantError::execution(ExecutionFailure::Database, e.to_string());

    let mut tables_stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .map_err(map_err)?;
    let names = tables_stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(map_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(map_err)?;

    let mut columns_stmt = conn
        .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(map_err)?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let columns = columns_stmt
            .query_map([&name], |row| {
                Ok(ColumnSchema {
                    name: row.get(0)?,
                    data_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })
            .map_err(map_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_err)?;
        tables.push(TableSchema { name, columns });
    }

    debug!("Introspected {} tables", tables.len());
    Ok(SchemaDescriptor { tables })
}

/// Cached introspection of one database file.
pub struct SchemaIntrospector {
    path: PathBuf,
    refresh: Duration,
    cached: RwLock<Option<(Instant, SchemaDescriptor)>>,
}

impl SchemaIntrospector {
    /// `refresh` of zero re-reads the schema on every call.
    pub fn new(path: impl Into<PathBuf>, refresh: Duration) -> Self {
        Self {
            path: path.into(),
            refresh,
            cached: RwLock::new(None),
        }
    }

    pub async fn descriptor(&self) -> Result<SchemaDescriptor> {
        if !self.refresh.is_zero() {
            let cached = self.cached.read().await;
            if let Some((at, schema)) = cached.as_ref() {
                if at.elapsed() < self.refresh {
                    return Ok(schema.clone());
                }
            }
        }

        let path = self.path.clone();
        let schema = tokio::task::spawn_blocking(move || introspect(&path))
            .await
            .map_err(|e| {
                AssistantError::execution(ExecutionFailure::Database, format!("introspection task: {}", e))
            })??;

        info!("Loaded schema for {} ({} tables)", self.path.display(), schema.tables.len());
        if !self.refresh.is_zero() {
            *self.cached.write().await = Some((Instant::now(), schema.clone()));
        }
        Ok(schema)
    }
}
