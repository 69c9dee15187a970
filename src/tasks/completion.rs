use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Task, TaskError, TaskOutput, TaskParams};
use crate::event_bus::{channels, AnswerPayload};
use crate::llm::LanguageModel;
use crate::tasks::{keys, stream_answer};

/// Plain streaming completion: prompt in, streamed answer out.
pub struct CompletionTask {
    model: Arc<dyn LanguageModel>,
    model_name: String,
    system_prompt: String,
}

impl CompletionTask {
    pub fn new(model: Arc<dyn LanguageModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            system_prompt: "You are a helpful assistant. Answer directly and concisely.".to_string(),
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }
}

#[async_trait]
impl Task for CompletionTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let prompt = params
            .data
            .as_str()
            .map(str::to_string)
            .or_else(|| params.context.get(&keys::QUERY))
            .ok_or_else(|| {
                TaskError::failed("completion requires a prompt string or a 'query' context entry")
            })?;

        let text = stream_answer(
            &self.model,
            &self.model_name,
            &params.events,
            params.cancel.clone(),
            &self.system_prompt,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::tasks::test_support::params;
    use serde_json::json;

    #[tokio::test]
    async fn streams_and_finalizes_answer() {
        let model = ScriptedModel::new();
        model.push_response("The capital of France is Paris.");
        let task = CompletionTask::new(Arc::new(model), "scripted");

        let (params, sink) = params(json!("What is the capital of France?"));
        let output = task.execute(params).await.unwrap();

        let (result, _) = match output {
            TaskOutput::Value(v) => (v, None::<()>),
            other => panic!("unexpected output: {other:?}"),
        };
        assert_eq!(result, json!("The capital of France is Paris."));

        let answers = sink.channel_events("answer");
        assert!(!answers.is_empty());
        let last = answers.last().unwrap();
        assert_eq!(last.payload["status"], json!("COMPLETED"));
        assert_eq!(
            last.payload["finalText"],
            json!("The capital of France is Paris.")
        );
    }

    #[tokio::test]
    async fn missing_prompt_fails() {
        let task = CompletionTask::new(Arc::new(ScriptedModel::new()), "scripted");
        let (params, _) = params(json!({}));
        assert!(task.execute(params).await.is_err());
    }
}
