use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Route, Task, TaskError, TaskOutput, TaskParams};
use crate::llm::LanguageModel;
use crate::tasks::{generate, keys};

/// Critique the current answer. When the critique finds gaps and the
/// revision budget allows, feedback is stored and control redirects back to
/// the writer; otherwise the answer stands.
pub struct ReflectorTask {
    model: Arc<dyn LanguageModel>,
    model_name: String,
    writer_task: String,
    max_revisions: u32,
}

impl ReflectorTask {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        model_name: impl Into<String>,
        writer_task: impl Into<String>,
    ) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            writer_task: writer_task.into(),
            max_revisions: 2,
        }
    }

    #[must_use]
    pub fn with_max_revisions(mut self, max_revisions: u32) -> Self {
        self.max_revisions = max_revisions;
        self
    }
}

#[async_trait]
impl Task for ReflectorTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let query = params.context.get(&keys::QUERY).unwrap_or_default();
        let answer = params
            .context
            .get(&keys::ANSWER)
            .ok_or_else(|| TaskError::failed("reflector requires an answer in context"))?;

        let verdict = generate(
            &self.model,
            &self.model_name,
            params.cancel.clone(),
            "You review answers for accuracy and completeness.",
            format!(
                "Question: {query}\n\nAnswer:\n{answer}\n\nIf the answer is complete and accurate, reply exactly APPROVED. Otherwise list what must be fixed."
            ),
        )
        .await?;

        let approved = verdict.trim().eq_ignore_ascii_case("APPROVED");
        let budget_spent = params
            .execution
            .has_reached_max_runs(params.task_name(), self.max_revisions);

        if !approved && !budget_spent {
            params.context.set(&keys::FEEDBACK, verdict.clone())?;
            params.redirect_to(Route::Next(self.writer_task.clone()));
            tracing::info!(
                run = params.execution.get_task_execution_count(params.task_name()) + 1,
                "answer needs revision; routing back to writer"
            );
        }

        Ok(TaskOutput::value(json!({
            "approved": approved,
            "verdict": verdict,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::tasks::test_support::params;

    #[tokio::test]
    async fn approval_does_not_redirect() {
        let model = ScriptedModel::new();
        model.push_response("APPROVED");
        let task = ReflectorTask::new(Arc::new(model), "scripted", "writer");

        let (params, _) = params(json!(null));
        params.context.set(&keys::ANSWER, "fine answer".to_string()).unwrap();
        let redirect = params.redirect.clone();

        let output = task.execute(params).await.unwrap();
        assert!(redirect.lock().is_none());
        match output {
            TaskOutput::Value(v) => assert_eq!(v["approved"], json!(true)),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn critique_redirects_to_writer_with_feedback() {
        let model = ScriptedModel::new();
        model.push_response("Missing the solar contribution.");
        let task = ReflectorTask::new(Arc::new(model), "scripted", "writer");

        let (params, _) = params(json!(null));
        params.context.set(&keys::ANSWER, "lunar only".to_string()).unwrap();
        let redirect = params.redirect.clone();
        let context = params.context.clone();

        task.execute(params).await.unwrap();
        assert_eq!(*redirect.lock(), Some(Route::Next("writer".to_string())));
        assert_eq!(
            context.get(&keys::FEEDBACK).as_deref(),
            Some("Missing the solar contribution.")
        );
    }

    #[tokio::test]
    async fn exhausted_budget_accepts_answer() {
        let model = ScriptedModel::new();
        model.push_response("Still not great.");
        let task = ReflectorTask::new(Arc::new(model), "scripted", "writer").with_max_revisions(1);

        let (params, _) = params(json!(null));
        params.context.set(&keys::ANSWER, "answer".to_string()).unwrap();
        // One completed run already recorded for this task name.
        params.execution.mark_task_complete("test-task", json!(null));
        let redirect = params.redirect.clone();

        task.execute(params).await.unwrap();
        assert!(redirect.lock().is_none());
    }
}
