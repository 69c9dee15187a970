use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Task, TaskError, TaskOutput, TaskParams};
use crate::event_bus::{channels, StepPayload, WorkflowStatus};
use crate::llm::LanguageModel;
use crate::tasks::{generate, keys};

/// Produce a short numbered plan for answering the query and store it for
/// downstream tasks.
pub struct PlanningTask {
    model: Arc<dyn LanguageModel>,
    model_name: String,
}

impl PlanningTask {
    pub fn new(model: Arc<dyn LanguageModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

#[async_trait]
impl Task for PlanningTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let query = params
            .context
            .get(&keys::QUERY)
            .or_else(|| params.data.as_str().map(str::to_string))
            .ok_or_else(|| TaskError::failed("planning requires a 'query' context entry"))?;

        let _ = params.events.emit(
            &channels::STEP,
            &StepPayload::new("planning", WorkflowStatus::Pending),
        );

        let plan = generate(
            &self.model,
            &self.model_name,
            params.cancel.clone(),
            "You are a research planner.",
            format!(
                "Break the question into a short numbered plan of research steps (max 5):\n\n{query}"
            ),
        )
        .await?;

        params.context.set(&keys::PLAN, plan.clone())?;
        let _ = params.events.emit(
            &channels::STEP,
            &StepPayload::new("planning", WorkflowStatus::Completed),
        );
        Ok(TaskOutput::value(json!(plan)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::tasks::test_support::params;

    #[tokio::test]
    async fn stores_plan_in_context() {
        let model = ScriptedModel::new();
        model.push_response("1. Search\n2. Read\n3. Summarize");
        let task = PlanningTask::new(Arc::new(model), "scripted");

        let (params, sink) = params(json!(null));
        params.context.set(&keys::QUERY, "how do tides work".to_string()).unwrap();
        let context = params.context.clone();

        task.execute(params).await.unwrap();
        assert_eq!(
            context.get(&keys::PLAN).as_deref(),
            Some("1. Search\n2. Read\n3. Summarize")
        );
        let steps = sink.channel_events("step");
        assert_eq!(steps.last().unwrap().payload["stepStatus"], json!("COMPLETED"));
    }
}
