use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Task, TaskError, TaskOutput, TaskParams};
use crate::event_bus::{channels, StepPayload, WorkflowStatus};
use crate::llm::LanguageModel;
use crate::tasks::{generate, keys, render_sources};

/// Distill the gathered sources into an analysis the writer can work from.
pub struct AnalyzerTask {
    model: Arc<dyn LanguageModel>,
    model_name: String,
}

impl AnalyzerTask {
    pub fn new(model: Arc<dyn LanguageModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

#[async_trait]
impl Task for AnalyzerTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let query = params.context.get(&keys::QUERY).unwrap_or_default();
        let sources = params.context.get(&keys::SOURCES).unwrap_or_default();
        if sources.is_empty() {
            return Err(TaskError::failed("analyzer requires sources in context"));
        }

        let _ = params.events.emit(
            &channels::STEP,
            &StepPayload::new("analysis", WorkflowStatus::Pending),
        );

        let analysis = generate(
            &self.model,
            &self.model_name,
            params.cancel.clone(),
            "You extract the key facts from search results.",
            format!(
                "Question: {query}\n\nSources:\n{}\n\nSummarize the facts relevant to the question, citing sources as [n].",
                render_sources(&sources)
            ),
        )
        .await?;

        params.context.set(&keys::ANALYSIS, analysis.clone())?;
        let _ = params.events.emit(
            &channels::STEP,
            &StepPayload::new("analysis", WorkflowStatus::Completed),
        );
        Ok(TaskOutput::value(json!(analysis)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::SourceItem;
    use crate::llm::ScriptedModel;
    use crate::tasks::test_support::params;

    #[tokio::test]
    async fn requires_sources() {
        let task = AnalyzerTask::new(Arc::new(ScriptedModel::new()), "scripted");
        let (params, _) = params(json!(null));
        assert!(task.execute(params).await.is_err());
    }

    #[tokio::test]
    async fn summarizes_sources_into_context() {
        let model = ScriptedModel::new();
        model.push_response("Tides follow lunar gravity [1].");
        let task = AnalyzerTask::new(Arc::new(model.clone()), "scripted");

        let (params, _) = params(json!(null));
        params.context.set(&keys::QUERY, "how do tides work".to_string()).unwrap();
        params
            .context
            .set(
                &keys::SOURCES,
                vec![SourceItem {
                    title: "Tides".into(),
                    link: "https://example.com".into(),
                    snippet: "Lunar gravity drives tides.".into(),
                }],
            )
            .unwrap();
        let context = params.context.clone();

        task.execute(params).await.unwrap();
        assert_eq!(
            context.get(&keys::ANALYSIS).as_deref(),
            Some("Tides follow lunar gravity [1].")
        );
        // The prompt carried the rendered source digest.
        assert!(model.recorded_prompts()[0].contains("[1] Tides"));
    }
}
