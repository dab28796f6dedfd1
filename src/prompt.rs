//! Prompt Builder
//!
//! Pure string construction: the chat system prompt (persona, schema, reply
//! rules), the replayed conversation window, the one-shot SQL prompt and the
//! report prompt.

use crate::config::PipelineConfig;
use crate::error::ExecutionFailure;
use crate::executor::QueryResult;
use crate::llm::ChatMessage;
use crate::reply::REPLY_FUNCTION_NAME;
use crate::schema::SchemaDescriptor;
use crate::session::{Role, Turn};

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    assistant_name: String,
    schema_notes: Option<String>,
    history_window: usize,
}

impl PromptBuilder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            assistant_name: config.assistant_name.clone(),
            schema_notes: config.schema_notes.clone(),
            history_window: config.history_window,
        }
    }

    fn schema_section(&self, schema: &SchemaDescriptor) -> String {
        let mut section = format!("Database Schema:\n{}", schema.render());
        if let Some(notes) = self.schema_notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            section.push_str("\nNotes on the data:\n");
            section.push_str(notes);
            section.push('\n');
        }
        section
    }

    /// System prompt for the chat flow.
    pub fn system_prompt(&self, schema: &SchemaDescriptor) -> String {
        format!(
            "You are '{name}', a friendly, helpful assistant with read-only access to a SQLite database.\n\n\
             You always respond in the same language the user uses.\n\n\
             You can only produce SQL queries that retrieve (SELECT) data, never modifying or deleting data. \
             When the user requests data from the database, generate a single valid SQL query that references \
             only the schema below. Use SELECT, JOIN, WHERE, GROUP BY, ORDER BY and similar read-only clauses. \
             No INSERT, UPDATE, DELETE, DROP, ALTER or CREATE.\n\n\
             {schema}\n\
             Always answer by calling {function}. Possible 'type' values:\n\
             \x20 - 'chat': the request does not need the database; 'query' must be empty.\n\
             \x20 - 'sql': some part of the request needs data; 'query' holds exactly one read-only statement.\n\
             \x20 - 'done': a multi-step answer is complete; 'query' must be empty and 'reply' must combine \
             the results of the earlier steps.\n\n\
             Rules:\n\
             1. If a request needs several data points, produce one query at a time. You will see its results \
             and may produce another query before answering with 'done'.\n\
             2. Check your SQL for correctness before answering. Output no chain-of-thought.\n\
             3. ORDER BY comes after UNION, not before.\n",
            name = self.assistant_name,
            schema = self.schema_section(schema),
            function = REPLY_FUNCTION_NAME,
        )
    }

    /// Most recent `history_window` turns as chat messages. Turns that ran a
    /// query carry it in a following system note.
    pub fn conversation(&self, history: &[Turn]) -> Vec<ChatMessage> {
        let start = history.len().saturating_sub(self.history_window);
        let mut messages = Vec::with_capacity((history.len() - start) * 2);
        for turn in &history[start..] {
            match turn.role {
                Role::User => messages.push(ChatMessage::user(turn.content.clone())),
                Role::Assistant => {
                    messages.push(ChatMessage::assistant(turn.content.clone()));
                    if let Some(sql) = turn.sql() {
                        let rows = turn.rows().map(|r| r.len()).unwrap_or(0);
                        messages.push(ChatMessage::system(format!(
                            "Query executed for the previous answer ({} rows): {}",
                            rows, sql
                        )));
                    }
                }
            }
        }
        messages
    }

    /// Query results handed back to the model between steps of one request.
    pub fn step_results(&self, result: &QueryResult, max_rows: usize) -> ChatMessage {
        let shown = &result.rows[..result.rows.len().min(max_rows)];
        let payload = serde_json::json!({
            "query_results": shown,
            "row_count": result.rows.len(),
            "truncated": result.truncated || shown.len() < result.rows.len(),
        });
        ChatMessage::system(payload.to_string())
    }

    /// Note handed back to the model when its query failed to run.
    pub fn step_failure(&self, kind: ExecutionFailure) -> ChatMessage {
        let payload = serde_json::json!({
            "query_error": format!("{:?}", kind),
            "explanation": kind.public_message(),
        });
        ChatMessage::system(payload.to_string())
    }

    /// One-shot natural language to SQL.
    pub fn sql_generation(&self, schema: &SchemaDescriptor, question: &str) -> Vec<ChatMessage> {
        let system = format!(
            "You are an expert SQL query generator specialized in SQLite. \
             You are provided with the following database schema:\n\n{}\n\
             When given a natural language query, generate an optimized, syntactically correct, read-only \
             SQL query that adheres exactly to the above schema. Check that the SQL is logically sound and \
             free of syntax errors. Output only the raw SQL statement with no additional text, and do not \
             include any markdown formatting or code fences.",
            self.schema_section(schema)
        );
        vec![
            ChatMessage::system(system),
            ChatMessage::user(format!("Convert this natural language query into SQL: {}", question)),
        ]
    }

    /// Plain-language summary of a result set.
    pub fn report(&self, question: &str, result: &QueryResult, max_rows: usize) -> Vec<ChatMessage> {
        let system = "You are a database reporting expert. Provide a concise final report that only \
                      summarizes the data returned for the user's question. Do not mention SQL, table or \
                      column names, or any other technical detail. Answer in the language of the question.";

        let body = if result.rows.is_empty() {
            "The query returned no rows.".to_string()
        } else {
            let shown = &result.rows[..result.rows.len().min(max_rows)];
            let mut body = format!(
                "Results ({} rows):\n{}",
                result.rows.len(),
                serde_json::to_string_pretty(shown).unwrap_or_default()
            );
            if shown.len() < result.rows.len() || result.truncated {
                body.push_str(&format!(
                    "\n\nOnly the first {} rows are shown; the full result is larger.",
                    shown.len()
                ));
            }
            body
        };

        vec![
            ChatMessage::system(system),
            ChatMessage::user(format!(
                "Question: {}\n{}\n\nBased solely on the results above, provide a concise report of the key insights.",
                question, body
            )),
        ]
    }
}
