use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Task, TaskError, TaskOutput, TaskParams};
use crate::llm::LanguageModel;
use crate::tasks::{generate, keys};

/// Rewrite the user's query into a focused search query.
pub struct RefineQueryTask {
    model: Arc<dyn LanguageModel>,
    model_name: String,
}

impl RefineQueryTask {
    pub fn new(model: Arc<dyn LanguageModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

#[async_trait]
impl Task for RefineQueryTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let query = params
            .context
            .get(&keys::QUERY)
            .or_else(|| params.data.as_str().map(str::to_string))
            .ok_or_else(|| TaskError::failed("refine-query requires a 'query' context entry"))?;

        let refined = generate(
            &self.model,
            &self.model_name,
            params.cancel.clone(),
            "You rewrite questions into precise web search queries.",
            format!(
                "Rewrite this question as a single short search query. Reply with the query only:\n\n{query}"
            ),
        )
        .await?;
        let refined = refined.trim().trim_matches('"').to_string();

        params.context.set(&keys::REFINED_QUERY, refined.clone())?;
        Ok(TaskOutput::value(json!(refined)))
    }
}
