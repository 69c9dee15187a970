use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Task, TaskError, TaskOutput, TaskParams};
use crate::graph::{AgentGraph, ResponseLog};
use crate::tasks::keys;

/// Drive an agent graph from inside a workflow: traversal starts at the
/// entry node with the task input and shares the workflow's event bus and
/// cancellation signal (wire the graph with them at construction).
pub struct GraphRunnerTask {
    graph: Arc<AgentGraph>,
    entry_node: String,
}

impl GraphRunnerTask {
    pub fn new(graph: Arc<AgentGraph>, entry_node: impl Into<String>) -> Self {
        Self {
            graph,
            entry_node: entry_node.into(),
        }
    }
}

#[async_trait]
impl Task for GraphRunnerTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let input = params
            .data
            .as_str()
            .map(str::to_string)
            .or_else(|| params.context.get(&keys::QUERY))
            .ok_or_else(|| TaskError::failed("graph runner requires a string input"))?;

        let responses = ResponseLog::new();
        let final_response = self
            .graph
            .execute_node(&self.entry_node, input, &responses)
            .await
            .map_err(|err| TaskError::failed(err.to_string()))?;

        params.context.set(&keys::ANSWER, final_response.clone())?;
        Ok(TaskOutput::value(json!({
            "response": final_response,
            "responses": responses.entries(),
        })))
    }
}
