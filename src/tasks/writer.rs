use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Task, TaskError, TaskOutput, TaskParams};
use crate::event_bus::{channels, AnswerPayload};
use crate::llm::LanguageModel;
use crate::tasks::{keys, stream_answer};

/// Compose the final answer from the analysis, streaming as it writes.
/// Reviewer feedback stored by the reflector is folded into the prompt on
/// revision runs.
pub struct WriterTask {
    model: Arc<dyn LanguageModel>,
    model_name: String,
}

impl WriterTask {
    pub fn new(model: Arc<dyn LanguageModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

#[async_trait]
impl Task for WriterTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let query = params.context.get(&keys::QUERY).unwrap_or_default();
        let analysis = params
            .context
            .get(&keys::ANALYSIS)
            .or_else(|| params.data.as_str().map(str::to_string))
            .ok_or_else(|| TaskError::failed("writer requires an analysis or input text"))?;

        let mut prompt = format!(
            "Question: {query}\n\nAnalysis:\n{analysis}\n\nWrite a clear, well-structured answer."
        );
        if let Some(feedback) = params.context.get(&keys::FEEDBACK) {
            prompt.push_str(&format!(
                "\n\nA reviewer raised these points; address them:\n{feedback}"
            ));
        }

        let text = stream_answer(
            &self.model,
            &self.model_name,
            &params.events,
            params.cancel.clone(),
            "You write precise, sourced answers.",
            prompt,
        )
        .await?;

        let _ = params
            .events
            .emit(&channels::ANSWER, &AnswerPayload::completed(&text));
        params.context.set(&keys::ANSWER, text.clone())?;
        Ok(TaskOutput::value(json!(text)))
    }
}
