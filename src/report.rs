//! Report Generator: a second model call that turns rows into prose.

use crate::error::{AssistantError, Result};
use crate::executor::QueryResult;
use crate::llm::{CompletionOptions, ModelClient};
use crate::prompt::PromptBuilder;
use std::sync::Arc;
use tracing::debug;

const REPORT_MAX_TOKENS: u32 = 200;

#[derive(Clone)]
pub struct ReportGenerator {
    model: Arc<dyn ModelClient>,
    prompts: PromptBuilder,
    max_rows: usize,
}

impl ReportGenerator {
    pub fn new(model: Arc<dyn ModelClient>, prompts: PromptBuilder, max_rows: usize) -> Self {
        Self {
            model,
            prompts,
            max_rows,
        }
    }

    pub async fn summarize(&self, question: &str, result: &QueryResult) -> Result<String> {
        let messages = self.prompts.report(question, result, self.max_rows);
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: Some(REPORT_MAX_TOKENS),
        };

        let report = self.model.complete(&messages, options).await?;
        let report = report.trim();
        if report.is_empty() {
            return Err(AssistantError::Upstream("model returned an empty report".to_string()));
        }
        debug!("Report for {} rows: {} chars", result.rows.len(), report.len());
        Ok(report.to_string())
    }
}
