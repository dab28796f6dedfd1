//! SQL Safety Gate
//!
//! Classify-then-allow: candidate text is extracted to a single statement,
//! scanned for mutating keywords, parsed with the SQLite dialect and
//! classified. Only a plain query passes. Every doubt is a rejection.

use crate::error::{AssistantError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::fmt;
use tracing::warn;

lazy_static! {
    static ref FORBIDDEN_KEYWORD: Regex = Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|ATTACH|DETACH|PRAGMA|VACUUM|REINDEX|TRUNCATE|GRANT|REVOKE|MERGE|UPSERT)\b|\bREPLACE\s+INTO\b"
    )
    .expect("forbidden keyword pattern");
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\n?(.*?)```").expect("fenced block pattern");
    static ref FIRST_WORD: Regex = Regex::new(r"[A-Za-z_]+").expect("first word pattern");
}

const READ_ONLY_LEADERS: [&str; 3] = ["SELECT", "WITH", "VALUES"];

/// Tagged statement kind produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementKind {
    Query,
    Insert,
    Update,
    Delete,
    Ddl,
    Pragma,
    Transaction,
    Other,
}

/// SQL text that passed the gate. Only this module can build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedSql(String);

impl AcceptedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AcceptedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AcceptedSql {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn reject(reason: impl Into<String>) -> AssistantError {
    AssistantError::UnsafeQuery(reason.into())
}

/// Pull a single SQL statement out of model output.
///
/// Accepts bare SQL, one fenced code block, or a `SQLQuery:`/`SQL:` marker.
/// More than one fenced block is ambiguous and rejected.
pub fn extract_sql(text: &str) -> Result<String> {
    let trimmed = text.trim();

    let blocks: Vec<&str> = FENCED_BLOCK
        .captures_iter(trimmed)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
        .collect();

    let candidate = match blocks.len() {
        0 if trimmed.contains("```") => return Err(reject("unterminated code fence")),
        0 => {
            let mut body = trimmed;
            for marker in ["SQLQuery:", "SQL:"] {
                if let Some(rest) = body.strip_prefix(marker) {
                    body = rest.trim_start();
                }
            }
            body
        }
        1 => blocks[0],
        n => return Err(reject(format!("{} SQL blocks in one reply", n))),
    };

    let candidate = candidate.trim().trim_end_matches(';').trim_end();
    if candidate.is_empty() {
        return Err(reject("no SQL statement found"));
    }
    Ok(candidate.to_string())
}

pub fn classify_statement(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(_) => StatementKind::Query,
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::AlterTable { .. }
        | Statement::Drop { .. } => StatementKind::Ddl,
        Statement::Pragma { .. } => StatementKind::Pragma,
        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. } => StatementKind::Transaction,
        _ => StatementKind::Other,
    }
}

fn set_expr_is_read_only(expr: &SetExpr) -> bool {
    match expr {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => query_is_read_only(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        SetExpr::Values(_) => true,
        _ => false,
    }
}

fn query_is_read_only(query: &Query) -> bool {
    let ctes_ok = query
        .with
        .as_ref()
        .map(|with| with.cte_tables.iter().all(|cte| query_is_read_only(&cte.query)))
        .unwrap_or(true);
    ctes_ok && set_expr_is_read_only(&query.body)
}

/// Parse `sql` and classify it. Anything other than exactly one statement is
/// an error.
pub fn classify(sql: &str) -> Result<StatementKind> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)
        .map_err(|e| reject(format!("unparseable SQL: {}", e)))?;

    match statements.as_slice() {
        [single] => Ok(classify_statement(single)),
        [] => Err(reject("no SQL statement found")),
        many => Err(reject(format!("{} statements in one query", many.len()))),
    }
}

/// Run the full gate over raw model output.
pub fn check(raw: &str) -> Result<AcceptedSql> {
    let result = check_inner(raw);
    if let Err(AssistantError::UnsafeQuery(reason)) = &result {
        warn!("Rejected SQL ({}): {}", reason, raw.trim());
    }
    result
}

fn check_inner(raw: &str) -> Result<AcceptedSql> {
    let sql = extract_sql(raw)?;

    if let Some(found) = FORBIDDEN_KEYWORD.find(&sql) {
        return Err(reject(format!("forbidden keyword '{}'", found.as_str())));
    }

    let leader = FIRST_WORD
        .find(&sql)
        .map(|m| m.as_str().to_ascii_uppercase())
        .unwrap_or_default();
    if !READ_ONLY_LEADERS.contains(&leader.as_str()) {
        return Err(reject(format!("statement starts with '{}'", leader)));
    }

    let statements = Parser::parse_sql(&SQLiteDialect {}, &sql)
        .map_err(|e| reject(format!("unparseable SQL: {}", e)))?;
    let statement = match statements.as_slice() {
        [single] => single,
        [] => return Err(reject("no SQL statement found")),
        many => return Err(reject(format!("{} statements in one query", many.len()))),
    };

    match statement {
        Statement::Query(query) if query_is_read_only(query) => Ok(AcceptedSql(sql)),
        Statement::Query(_) => Err(reject("query body is not a plain read")),
        other => Err(reject(format!("{:?} statement", classify_statement(other)))),
    }
}
