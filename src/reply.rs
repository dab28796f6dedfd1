//! Structured reply contract between the pipeline and the model.
//!
//! The chat flow forces the model to call `handle_user_request_v1`, whose
//! arguments carry a `type` discriminator. Bump the version suffix whenever
//! the argument shape changes.

use crate::error::{AssistantError, Result};
use crate::llm::{FunctionCall, FunctionDefinition};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const REPLY_CONTRACT_VERSION: u32 = 1;
pub const REPLY_FUNCTION_NAME: &str = "handle_user_request_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    /// No database access needed
    Chat,
    /// Exactly one read-only query must run
    Sql,
    /// Multi-step work is finished
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReply {
    #[serde(rename = "type")]
    pub kind: ReplyKind,
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub query: String,
}

impl ModelReply {
    /// Parse and validate the arguments of a reply function call.
    ///
    /// A reply is rejected when its kind and payload disagree: `sql` without a
    /// query, or `chat`/`done` carrying one.
    pub fn from_call(call: &FunctionCall) -> Result<Self> {
        if call.name != REPLY_FUNCTION_NAME {
            return Err(AssistantError::MalformedReply(format!(
                "unexpected function '{}'",
                call.name
            )));
        }
        Self::parse(&call.arguments)
    }

    pub fn parse(arguments: &str) -> Result<Self> {
        let raw = strip_json_fence(arguments);
        let reply: ModelReply = serde_json::from_str(raw)
            .map_err(|e| AssistantError::MalformedReply(format!("reply is not valid JSON: {}", e)))?;
        reply.validate()?;
        Ok(reply)
    }

    fn validate(&self) -> Result<()> {
        let has_query = !self.query.trim().is_empty();
        match self.kind {
            ReplyKind::Sql if !has_query => Err(AssistantError::MalformedReply(
                "type 'sql' without a query".to_string(),
            )),
            ReplyKind::Chat | ReplyKind::Done if has_query => Err(AssistantError::MalformedReply(
                format!("type '{:?}' must not carry a query", self.kind).to_lowercase(),
            )),
            ReplyKind::Chat | ReplyKind::Done if self.reply.trim().is_empty() => Err(
                AssistantError::MalformedReply("conversational reply is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

fn strip_json_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Function schema the chat flow forces the model to call.
pub fn reply_function() -> FunctionDefinition {
    FunctionDefinition {
        name: REPLY_FUNCTION_NAME.to_string(),
        description: format!(
            "Reply contract v{}. Give the response in the language of the user. \
             Use 'chat' when no database data is needed, 'sql' when one read-only query must run, \
             and 'done' when a multi-step answer is complete. 'query' must be empty unless type is 'sql'.",
            REPLY_CONTRACT_VERSION
        ),
        parameters: json!({
            "type": "object",
            "properties": {
                "type": {
                    "type": "string",
                    "enum": ["chat", "sql", "done"],
                    "description": "'chat', 'sql', or 'done'."
                },
                "reply": {
                    "type": "string",
                    "description": "User-facing text. For 'sql' it may describe the purpose of the query."
                },
                "query": {
                    "type": "string",
                    "description": "A single read-only SQL statement when type is 'sql'; otherwise an empty string."
                }
            },
            "required": ["type", "reply", "query"],
            "additionalProperties": false
        }),
    }
}
