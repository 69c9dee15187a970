use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Task, TaskError, TaskOutput, TaskParams};
use crate::event_bus::channels;
use crate::llm::LanguageModel;
use crate::tasks::{generate, keys};

/// Generate follow-up questions for the finished answer.
pub struct SuggestionsTask {
    model: Arc<dyn LanguageModel>,
    model_name: String,
    count: usize,
}

impl SuggestionsTask {
    pub fn new(model: Arc<dyn LanguageModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            count: 3,
        }
    }

    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }
}

#[async_trait]
impl Task for SuggestionsTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let query = params.context.get(&keys::QUERY).unwrap_or_default();
        let answer = params.context.get(&keys::ANSWER).unwrap_or_default();

        let raw = generate(
            &self.model,
            &self.model_name,
            params.cancel.clone(),
            "You suggest natural follow-up questions.",
            format!(
                "Question: {query}\n\nAnswer:\n{answer}\n\nList {} short follow-up questions, one per line.",
                self.count
            ),
        )
        .await?;

        let suggestions: Vec<String> = raw
            .lines()
            .map(|line| line.trim_start_matches(['-', '*', ' ']).trim())
            .map(|line| line.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')').trim())
            .filter(|line| !line.is_empty())
            .take(self.count)
            .map(str::to_string)
            .collect();

        let _ = params.events.emit(&channels::SUGGESTIONS, &suggestions);
        Ok(TaskOutput::value(json!(suggestions)))
    }
}
