//! Model Client
//!
//! Thin client for an OpenAI-compatible `/chat/completions` endpoint. Every
//! failure (transport, timeout, non-success status, unusable body) comes back
//! as `AssistantError::Upstream`; transient ones are retried with backoff.

use crate::config::LlmConfig;
use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Message in OpenAI chat format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Function definition for OpenAI API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Function call response from OpenAI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
        }
    }
}

/// What the pipeline needs from a language model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Plain completion; returns the assistant message text.
    async fn complete(&self, messages: &[ChatMessage], options: CompletionOptions) -> Result<String>;

    /// Forced function call; returns the call the model produced.
    ///
    /// If the model answers with text instead, the text is returned as the
    /// arguments of a call named after `function` so the caller can still try
    /// to parse it against the same contract.
    async fn call_function(
        &self,
        messages: &[ChatMessage],
        function: &FunctionDefinition,
    ) -> Result<FunctionCall>;

    fn model_name(&self) -> &str;
}

enum AttemptError {
    Retryable(String),
    Fatal(String),
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AssistantError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        })
    }

    fn request_body(&self, messages: &[ChatMessage], options: CompletionOptions) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
        });

        if let Some(max_tokens) = options.max_tokens {
            // Newer models only accept max_completion_tokens
            if self.model.starts_with("gpt-4") || self.model.starts_with("gpt-5") || self.model.contains("o1") {
                body["max_completion_tokens"] = json!(max_tokens);
            } else {
                body["max_tokens"] = json!(max_tokens);
            }
        }
        body
    }

    async fn post_once(&self, body: &Value) -> std::result::Result<Value, AttemptError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("LLM API error ({}): {}", status, error_text);
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(AttemptError::Retryable(message))
            } else {
                Err(AttemptError::Fatal(message))
            };
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| AttemptError::Fatal(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(AttemptError::Fatal(format!("LLM API error: {}", error)));
        }

        Ok(response_json)
    }

    async fn post_with_retry(&self, body: &Value) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            match self.post_once(body).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Retryable(message)) if attempt < self.max_retries => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        "LLM call failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        self.max_retries + 1,
                        delay,
                        message
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Retryable(message)) | Err(AttemptError::Fatal(message)) => {
                    return Err(AssistantError::Upstream(message));
                }
            }
        }
    }
}

/// First choice's message object, rejecting empty or filtered responses.
fn first_message(response_json: &Value) -> Result<&Value> {
    let choices = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| AssistantError::Upstream("No choices array in LLM response".to_string()))?;

    let choice = choices
        .first()
        .ok_or_else(|| AssistantError::Upstream("Empty choices array in LLM response".to_string()))?;

    match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("content_filter") => {
            return Err(AssistantError::Upstream(
                "LLM response was filtered by content policy".to_string(),
            ))
        }
        Some("length") => warn!("LLM response was truncated due to length limit"),
        _ => {}
    }

    choice
        .get("message")
        .ok_or_else(|| AssistantError::Upstream("No message in LLM response".to_string()))
}

#[async_trait]
impl ModelClient for LlmClient {
    async fn complete(&self, messages: &[ChatMessage], options: CompletionOptions) -> Result<String> {
        let body = self.request_body(messages, options);
        let response_json = self.post_with_retry(&body).await?;
        let message = first_message(&response_json)?;

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .map(str::trim)
            .unwrap_or("");
        if content.is_empty() {
            return Err(AssistantError::Upstream("Empty content in LLM response".to_string()));
        }
        debug!("LLM completion: {} chars", content.len());
        Ok(content.to_string())
    }

    async fn call_function(
        &self,
        messages: &[ChatMessage],
        function: &FunctionDefinition,
    ) -> Result<FunctionCall> {
        let mut body = self.request_body(messages, CompletionOptions::default());
        body["functions"] = json!([{
            "name": function.name,
            "description": function.description,
            "parameters": function.parameters,
        }]);
        body["function_call"] = json!({ "name": function.name });

        let response_json = self.post_with_retry(&body).await?;
        let message = first_message(&response_json)?;

        if let Some(call) = message.get("function_call") {
            let name = call
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| AssistantError::Upstream("No function name in function_call".to_string()))?
                .to_string();
            let arguments = call
                .get("arguments")
                .and_then(|a| a.as_str())
                .ok_or_else(|| AssistantError::Upstream("No arguments in function_call".to_string()))?
                .to_string();
            return Ok(FunctionCall { name, arguments });
        }

        match message.get("content").and_then(|c| c.as_str()) {
            Some(content) if !content.trim().is_empty() => {
                warn!("LLM answered with text instead of calling {}", function.name);
                Ok(FunctionCall {
                    name: function.name.clone(),
                    arguments: content.trim().to_string(),
                })
            }
            _ => Err(AssistantError::Upstream(
                "LLM returned neither a function call nor content".to_string(),
            )),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
