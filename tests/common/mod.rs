#![allow(dead_code)]

use async_trait::async_trait;
use rusqlite::Connection;
use sql_assistant::config::SessionBackend;
use sql_assistant::llm::{CompletionOptions, FunctionCall, FunctionDefinition};
use sql_assistant::reply::REPLY_FUNCTION_NAME;
use sql_assistant::{AppConfig, Assistant, AssistantError, ChatMessage, InMemorySessionStore, ModelClient, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Create the query database used across the integration tests
pub fn create_test_database(dir: &Path) -> std::result::Result<PathBuf, Box<dyn std::error::Error>> {
    let path = dir.join("data.db");
    let conn = Connection::open(&path)?;
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, country TEXT);
         INSERT INTO customers VALUES (1, 'Anna', 'Germany');
         INSERT INTO customers VALUES (2, 'Ben', 'France');
         INSERT INTO customers VALUES (3, 'Clara', 'Germany');
         INSERT INTO customers VALUES (4, 'Dmitri', 'Spain');
         CREATE TABLE stores (StoreID INTEGER PRIMARY KEY, State TEXT, ZipCode TEXT);
         INSERT INTO stores VALUES (1, 'NY', '10001');
         INSERT INTO stores VALUES (2, 'TX', '73301');",
    )?;
    Ok(path)
}

pub fn customer_count(path: &Path) -> i64 {
    Connection::open(path)
        .unwrap()
        .query_row("SELECT COUNT(*) FROM customers", [], |r| r.get(0))
        .unwrap()
}

pub fn test_config(data_path: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.llm.api_key = "test-key".to_string();
    config.database.data_path = data_path.to_path_buf();
    config.database.query_timeout = Duration::from_secs(5);
    config.sessions.backend = SessionBackend::Memory;
    config.pipeline.schema_refresh = Duration::ZERO;
    config
}

pub fn build_assistant(config: &AppConfig, model: Arc<ScriptedModel>) -> (Arc<Assistant>, Arc<InMemorySessionStore>) {
    let store = Arc::new(InMemorySessionStore::new(config.sessions.max_turns));
    let assistant = Arc::new(Assistant::new(config, model, store.clone()));
    (assistant, store)
}

/// Model that plays back queued answers and records every prompt it saw
#[derive(Default)]
pub struct ScriptedModel {
    calls: Mutex<VecDeque<Result<FunctionCall>>>,
    completions: Mutex<VecDeque<Result<String>>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a `handle_user_request_v1` call.
    pub fn reply(self, kind: &str, reply: &str, query: &str) -> Self {
        let arguments = serde_json::json!({ "type": kind, "reply": reply, "query": query }).to_string();
        self.raw_call(REPLY_FUNCTION_NAME, &arguments)
    }

    pub fn raw_call(self, name: &str, arguments: &str) -> Self {
        self.calls.lock().unwrap().push_back(Ok(FunctionCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        }));
        self
    }

    pub fn failing_call(self, message: &str) -> Self {
        self.calls
            .lock()
            .unwrap()
            .push_back(Err(AssistantError::Upstream(message.to_string())));
        self
    }

    pub fn completion(self, text: &str) -> Self {
        self.completions.lock().unwrap().push_back(Ok(text.to_string()));
        self
    }

    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.calls.lock().unwrap().len() + self.completions.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage], _options: CompletionOptions) -> Result<String> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AssistantError::Upstream("connection refused".to_string())))
    }

    async fn call_function(&self, messages: &[ChatMessage], _function: &FunctionDefinition) -> Result<FunctionCall> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.calls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AssistantError::Upstream("connection refused".to_string())))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
