//! Natural-language SQL assistant.
//!
//! Turns chat messages into read-only SQLite queries through an
//! OpenAI-compatible model, runs them behind a safety gate and reports the
//! results in plain language.

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod reply;
pub mod report;
pub mod safety;
pub mod schema;
pub mod session;

pub use config::AppConfig;
pub use error::{AssistantError, ExecutionFailure, Result};
pub use executor::{QueryExecutor, QueryResult, Row};
pub use llm::{ChatMessage, LlmClient, ModelClient};
pub use pipeline::{Assistant, ChatOutcome, ReportOutcome, REFUSAL_MESSAGE};
pub use safety::AcceptedSql;
pub use session::{InMemorySessionStore, SessionStore, SqliteSessionStore, Turn};
