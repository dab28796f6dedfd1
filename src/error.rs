use thiserror::Error;

/// Category of a database-side failure, used to pick a user-facing explanation
/// without echoing the driver's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    Syntax,
    MissingTable,
    MissingColumn,
    Timeout,
    ReadOnlyViolation,
    Database,
}

impl ExecutionFailure {
    pub fn public_message(self) -> &'static str {
        match self {
            ExecutionFailure::Syntax => {
                "I couldn't build a valid query for that question. Could you rephrase it?"
            }
            ExecutionFailure::MissingTable | ExecutionFailure::MissingColumn => {
                "That question refers to data I can't find in the database."
            }
            ExecutionFailure::Timeout => {
                "That question took too long to answer. Try narrowing it down."
            }
            ExecutionFailure::ReadOnlyViolation => {
                "I can only read data, not change it."
            }
            ExecutionFailure::Database => {
                "The database couldn't answer that question right now."
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Malformed model reply: {0}")]
    MalformedReply(String),

    #[error("Unsafe query rejected: {0}")]
    UnsafeQuery(String),

    #[error("Execution error ({kind:?}): {detail}")]
    Execution {
        kind: ExecutionFailure,
        detail: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session store error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AssistantError {
    pub fn execution(kind: ExecutionFailure, detail: impl Into<String>) -> Self {
        AssistantError::Execution {
            kind,
            detail: detail.into(),
        }
    }

    /// True for failures that come from the model provider side.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            AssistantError::Upstream(_) | AssistantError::MalformedReply(_)
        )
    }

    /// Bounded, non-technical text that is safe to return to an end user.
    pub fn public_message(&self) -> String {
        match self {
            AssistantError::Upstream(_) | AssistantError::MalformedReply(_) => {
                "The assistant is temporarily unavailable. Please try again in a moment.".to_string()
            }
            AssistantError::UnsafeQuery(_) => crate::pipeline::REFUSAL_MESSAGE.to_string(),
            AssistantError::Execution { kind, .. } => kind.public_message().to_string(),
            AssistantError::InvalidRequest(reason) => reason.clone(),
            AssistantError::Storage(_)
            | AssistantError::Config(_)
            | AssistantError::Io(_)
            | AssistantError::Json(_) => {
                "Something went wrong while handling your request.".to_string()
            }
        }
    }
}

impl From<rusqlite::Error> for AssistantError {
    fn from(err: rusqlite::Error) -> Self {
        AssistantError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AssistantError>;
