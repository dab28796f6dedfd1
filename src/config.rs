//! Service configuration
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! the server binary first). Sub-configs carry their own defaults so tests can
//! build just the piece they need.

use crate::error::{AssistantError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite file the generated queries run against (opened read-only)
    pub data_path: PathBuf,
    pub row_limit: usize,
    pub query_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data.db"),
            row_limit: 1000,
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// Where conversation turns live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    Sqlite(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backend: SessionBackend,
    pub max_turns: usize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Sqlite(PathBuf::from("chat_history.db")),
            max_turns: 200,
            ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub assistant_name: String,
    /// Upper bound on model calls within a single chat request
    pub max_iterations: u32,
    /// Most recent turns replayed to the model
    pub history_window: usize,
    pub schema_refresh: Duration,
    pub schema_notes: Option<String>,
    pub report_max_rows: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Bo".to_string(),
            max_iterations: 8,
            history_window: 20,
            schema_refresh: Duration::from_secs(60),
            schema_notes: None,
            report_max_rows: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub sessions: SessionConfig,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("OPENAI_API_KEY")
            .ok_or_else(|| AssistantError::Config("OPENAI_API_KEY must be set".to_string()))?;

        let llm = LlmConfig {
            api_key,
            base_url: get("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 30u64)?),
            max_retries: parse_or(&get, "LLM_MAX_RETRIES", 2u32)?,
            retry_backoff: Duration::from_millis(parse_or(&get, "LLM_RETRY_BACKOFF_MS", 500u64)?),
        };

        let database = DatabaseConfig {
            data_path: get("DATA_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data.db")),
            row_limit: parse_or(&get, "QUERY_ROW_LIMIT", 1000usize)?,
            query_timeout: Duration::from_secs(parse_or(&get, "QUERY_TIMEOUT_SECS", 10u64)?),
        };

        let backend = match get("CHAT_DB_PATH") {
            Some(path) if path == ":memory:" => SessionBackend::Memory,
            Some(path) => SessionBackend::Sqlite(PathBuf::from(path)),
            None => SessionBackend::Sqlite(PathBuf::from("chat_history.db")),
        };

        let sessions = SessionConfig {
            backend,
            max_turns: parse_or(&get, "SESSION_MAX_TURNS", 200usize)?,
            ttl: Duration::from_secs(parse_or(&get, "SESSION_TTL_SECS", 86_400u64)?),
            sweep_interval: Duration::from_secs(parse_or(&get, "SESSION_SWEEP_SECS", 300u64)?),
        };

        let schema_notes = match get("SCHEMA_NOTES_PATH") {
            Some(path) => Some(std::fs::read_to_string(&path).map_err(|e| {
                AssistantError::Config(format!("cannot read SCHEMA_NOTES_PATH {}: {}", path, e))
            })?),
            None => None,
        };

        let max_iterations = parse_or(&get, "MULTI_TURN_MAX", 8u32)?;
        if max_iterations == 0 {
            return Err(AssistantError::Config("MULTI_TURN_MAX must be at least 1".to_string()));
        }

        let pipeline = PipelineConfig {
            assistant_name: get("ASSISTANT_NAME").unwrap_or_else(|| "Bo".to_string()),
            max_iterations,
            history_window: parse_or(&get, "HISTORY_WINDOW", 20usize)?,
            schema_refresh: Duration::from_secs(parse_or(&get, "SCHEMA_REFRESH_SECS", 60u64)?),
            schema_notes,
            report_max_rows: parse_or(&get, "REPORT_MAX_ROWS", 50usize)?,
        };

        let server = ServerConfig {
            host: get("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "SERVER_PORT", 8000u16)?,
            cors_origins: get("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["http://localhost:3000".to_string()]),
        };

        Ok(Self {
            llm,
            database,
            sessions,
            pipeline,
            server,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| AssistantError::Config(format!("invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
