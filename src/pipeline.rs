//! Assistant Pipeline
//!
//! Orchestrates schema introspection, prompting, the reply contract, the
//! safety gate, execution, reporting and conversation state.
//!
//! Chat flow for one request (serialized per session):
//! 1. Replay the history window after the system prompt.
//! 2. Ask the model for a `handle_user_request_v1` call. The user turn is
//!    stored once the first reply parses.
//! 3. `chat`/`done` ends the request. `sql` goes through the gate, runs, is
//!    reported, and its rows are handed back to the model for the next step.
//!    A query that fails to run hands its failure category back instead.
//! 4. Stop after `max_iterations` model calls.

use crate::config::AppConfig;
use crate::error::{AssistantError, Result};
use crate::executor::{QueryExecutor, QueryResult, Row};
use crate::llm::{ChatMessage, CompletionOptions, ModelClient};
use crate::prompt::PromptBuilder;
use crate::reply::{reply_function, ModelReply, ReplyKind};
use crate::report::ReportGenerator;
use crate::safety::{self, AcceptedSql};
use crate::schema::SchemaIntrospector;
use crate::session::{SessionLocks, SessionStore, SessionSummary, Turn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Reply given in the chat flow when the model proposes a query the gate rejects.
pub const REFUSAL_MESSAGE: &str =
    "I can only look data up, not change it, so I can't run that request.";

/// One executed query within a chat request.
#[derive(Debug, Clone, Serialize)]
pub struct SqlStep {
    pub turn: u32,
    pub query: String,
    pub results: Vec<Row>,
    pub truncated: bool,
    pub report: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: ReplyKind,
    pub final_message: String,
    pub last_query: String,
    pub last_results: Vec<Row>,
    pub sql_history: Vec<SqlStep>,
    pub turns_executed: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub query: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub results: Vec<Row>,
    pub truncated: bool,
    pub report: String,
}

pub struct Assistant {
    model: Arc<dyn ModelClient>,
    schema: SchemaIntrospector,
    executor: QueryExecutor,
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    prompts: PromptBuilder,
    reporter: ReportGenerator,
    max_iterations: u32,
    step_rows: usize,
    session_ttl: Duration,
}

impl Assistant {
    pub fn new(config: &AppConfig, model: Arc<dyn ModelClient>, store: Arc<dyn SessionStore>) -> Self {
        let prompts = PromptBuilder::new(&config.pipeline);
        Self {
            schema: SchemaIntrospector::new(&config.database.data_path, config.pipeline.schema_refresh),
            executor: QueryExecutor::new(
                &config.database.data_path,
                config.database.row_limit,
                config.database.query_timeout,
            ),
            store,
            locks: SessionLocks::new(),
            reporter: ReportGenerator::new(model.clone(), prompts.clone(), config.pipeline.report_max_rows),
            prompts,
            model,
            max_iterations: config.pipeline.max_iterations.max(1),
            step_rows: config.pipeline.report_max_rows,
            session_ttl: config.sessions.ttl,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Handle one chat message. A missing session id starts a new session.
    pub async fn chat(&self, session_id: Option<String>, message: &str) -> Result<ChatOutcome> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AssistantError::InvalidRequest("message must not be empty".to_string()));
        }
        let session_id = match session_id.map(|s| s.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };

        let guard = self.locks.acquire(&session_id).await;
        let outcome = self.chat_locked(&session_id, message).await;
        drop(guard);
        self.locks.release_idle(&session_id);

        if let Err(e) = &outcome {
            error!("Chat request for session {} failed: {}", session_id, e);
        }
        outcome
    }

    async fn chat_locked(&self, session_id: &str, message: &str) -> Result<ChatOutcome> {
        let schema = self.schema.descriptor().await?;
        let id = session_id.to_string();
        let history = self.with_store(move |store| store.history(&id)).await?;

        let mut messages = vec![ChatMessage::system(self.prompts.system_prompt(&schema))];
        messages.extend(self.prompts.conversation(&history));
        messages.push(ChatMessage::user(message));

        let function = reply_function();
        let mut outcome = ChatOutcome {
            session_id: session_id.to_string(),
            kind: ReplyKind::Chat,
            final_message: String::new(),
            last_query: String::new(),
            last_results: Vec::new(),
            sql_history: Vec::new(),
            turns_executed: 0,
        };
        let mut user_recorded = false;
        let mut step_failed = false;

        while outcome.turns_executed < self.max_iterations {
            outcome.turns_executed += 1;
            let call = self.model.call_function(&messages, &function).await?;
            let reply = ModelReply::from_call(&call)?;
            if !user_recorded {
                self.record(session_id, Turn::user(message)).await?;
                user_recorded = true;
            }
            outcome.kind = reply.kind;
            step_failed = false;

            match reply.kind {
                ReplyKind::Chat | ReplyKind::Done => {
                    outcome.final_message = reply.reply.clone();
                    self.record(session_id, Turn::assistant(reply.reply)).await?;
                    break;
                }
                ReplyKind::Sql => {
                    let sql = match safety::check(&reply.query) {
                        Ok(sql) => sql,
                        Err(AssistantError::UnsafeQuery(_)) => {
                            outcome.kind = ReplyKind::Chat;
                            outcome.final_message = REFUSAL_MESSAGE.to_string();
                            self.record(session_id, Turn::assistant(REFUSAL_MESSAGE)).await?;
                            break;
                        }
                        Err(e) => return Err(e),
                    };

                    let result = match self.executor.execute(&sql).await {
                        Ok(result) => result,
                        Err(AssistantError::Execution { kind, detail }) => {
                            warn!(
                                "Session {} step {}: query failed ({:?}): {}",
                                session_id, outcome.turns_executed, kind, detail
                            );
                            messages.push(ChatMessage::assistant(serde_json::to_string(&reply)?));
                            messages.push(self.prompts.step_failure(kind));
                            outcome.kind = ReplyKind::Chat;
                            outcome.final_message = kind.public_message().to_string();
                            step_failed = true;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    let report = self.reporter.summarize(message, &result).await?;
                    self.record(session_id, Turn::assistant_with_query(report.clone(), &sql, &result))
                        .await?;

                    info!(
                        "Session {} step {}: {} rows",
                        session_id,
                        outcome.turns_executed,
                        result.rows.len()
                    );

                    messages.push(ChatMessage::assistant(serde_json::to_string(&reply)?));
                    messages.push(self.prompts.step_results(&result, self.step_rows));

                    outcome.sql_history.push(SqlStep {
                        turn: outcome.turns_executed,
                        query: sql.as_str().to_string(),
                        results: result.rows.clone(),
                        truncated: result.truncated,
                        report: report.clone(),
                    });
                    outcome.final_message = report;
                    outcome.last_query = sql.into_inner();
                    outcome.last_results = result.rows;
                }
            }
        }

        if step_failed {
            self.record(session_id, Turn::assistant(outcome.final_message.clone()))
                .await?;
        } else if outcome.kind == ReplyKind::Sql && self.max_iterations > 1 {
            warn!(
                "Session {} hit the step limit ({}); returning the last report",
                session_id, self.max_iterations
            );
        }
        Ok(outcome)
    }

    /// Run a session store call on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&*store))
            .await
            .map_err(|e| AssistantError::Storage(format!("session store task: {}", e)))?
    }

    async fn record(&self, session_id: &str, turn: Turn) -> Result<()> {
        let id = session_id.to_string();
        self.with_store(move |store| store.append(&id, turn)).await
    }

    /// Natural language to gated SQL, without executing it.
    pub async fn generate_sql(&self, question: &str) -> Result<AcceptedSql> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AssistantError::InvalidRequest("query must not be empty".to_string()));
        }
        let schema = self.schema.descriptor().await?;
        let messages = self.prompts.sql_generation(&schema, question);
        let raw = self.model.complete(&messages, CompletionOptions::default()).await?;
        let sql = safety::check(&raw)?;
        info!("Generated SQL: {}", sql);
        Ok(sql)
    }

    /// Gate and run caller-supplied SQL.
    pub async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        if sql.trim().is_empty() {
            return Err(AssistantError::InvalidRequest("sql must not be empty".to_string()));
        }
        let sql = safety::check(sql)?;
        self.executor.execute(&sql).await
    }

    /// Generate, run and summarize in one go.
    pub async fn report(&self, question: &str) -> Result<ReportOutcome> {
        let sql = self.generate_sql(question).await?;
        let result = self.executor.execute(&sql).await?;
        let report = self.reporter.summarize(question.trim(), &result).await?;
        Ok(ReportOutcome {
            query: question.trim().to_string(),
            sql: sql.into_inner(),
            columns: result.columns,
            results: result.rows,
            truncated: result.truncated,
            report,
        })
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<Turn>> {
        let id = session_id.to_string();
        self.with_store(move |store| store.history(&id)).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        self.with_store(|store| store.sessions()).await
    }

    /// Evict idle sessions; returns how many were dropped.
    pub async fn sweep(&self) -> Result<usize> {
        let ttl = self.session_ttl;
        let removed = self.with_store(move |store| store.evict_expired(ttl)).await?;
        if removed > 0 {
            info!("Evicted {} idle sessions", removed);
        }
        Ok(removed)
    }
}

/// Run `sweep` on a fixed interval until the task is dropped.
pub fn spawn_sweeper(assistant: Arc<Assistant>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = assistant.sweep().await {
                warn!("Session sweep failed: {}", e);
            }
        }
    })
}
