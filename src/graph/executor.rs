use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use miette::Diagnostic;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::chunk::ChunkBuffer;
use crate::event_bus::{channels, AnswerPayload, EventBus, StepPayload, WorkflowStatus};
use crate::graph::edge::{Edge, EdgePattern, StopCondition};
use crate::graph::node::{AgentNode, GraphExecutionState, NodeStateRecord, NodeStatus};
use crate::graph::patterns;
use crate::llm::{GenerateTextRequest, LanguageModel, LlmError, Tool, ToolError};
use crate::message::Message;

/// Streaming flush threshold for node output (characters).
const STREAM_THRESHOLD: usize = 96;

/// Errors from graph traversal.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("node not found: {name}")]
    #[diagnostic(
        code(taskloom::graph::node_not_found),
        help("Add the node before wiring edges to it.")
    )]
    NodeNotFound { name: String },

    #[error("node '{node}' generation failed: {source}")]
    #[diagnostic(code(taskloom::graph::llm))]
    Llm {
        node: String,
        #[source]
        source: LlmError,
    },

    #[error("node '{node}' tool call failed: {source}")]
    #[diagnostic(code(taskloom::graph::tool))]
    Tool {
        node: String,
        #[source]
        source: ToolError,
    },
}

/// Shared accumulator of node responses across a traversal.
///
/// Appended to by every node execution; fan-out siblings append in
/// completion order.
#[derive(Clone, Default)]
pub struct ResponseLog {
    entries: Arc<RwLock<Vec<String>>>,
}

impl ResponseLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: String) {
        self.entries.write().push(response);
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Node-and-edge traversal layer over the workflow primitives.
///
/// Nodes encapsulate a prompt template and LLM policy; edges carry one of
/// seven control-flow patterns. Traversal streams model output through the
/// event bus and records every node's result in the execution state.
pub struct AgentGraph {
    model_name: String,
    model: Arc<dyn LanguageModel>,
    nodes: FxHashMap<String, AgentNode>,
    edges: Vec<Edge>,
    tools: FxHashMap<String, Arc<dyn Tool>>,
    state: Arc<RwLock<GraphExecutionState>>,
    events: EventBus,
    cancel: CancellationToken,
    max_iterations: u32,
}

impl AgentGraph {
    pub fn new(
        model_name: impl Into<String>,
        model: Arc<dyn LanguageModel>,
        events: EventBus,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            model,
            nodes: FxHashMap::default(),
            edges: Vec::new(),
            tools: FxHashMap::default(),
            state: Arc::new(RwLock::new(GraphExecutionState::default())),
            events,
            cancel: CancellationToken::new(),
            max_iterations: 10,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Default iteration cap for loop and revision edges.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn add_node(&mut self, node: AgentNode) -> &mut Self {
        self.nodes.insert(node.name.clone(), node);
        self
    }

    pub fn add_edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn get_node(&self, name: &str) -> Option<&AgentNode> {
        self.nodes.get(name)
    }

    /// Names of nodes with an edge terminating at `name`, in edge
    /// declaration order.
    pub fn input_nodes(&self, name: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|edge| edge.to == name)
            .map(|edge| edge.from.clone())
            .collect()
    }

    /// A copy of the current traversal state.
    #[must_use]
    pub fn execution_state(&self) -> GraphExecutionState {
        self.state.read().clone()
    }

    /// Recorded results per node.
    #[must_use]
    pub fn results(&self) -> FxHashMap<String, String> {
        self.state.read().results.clone()
    }

    /// The bus this graph streams on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn default_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub(crate) fn edges_from(&self, name: &str, pattern: EdgePattern) -> Vec<Edge> {
        self.edges
            .iter()
            .filter(|edge| edge.from == name && edge.pattern == pattern)
            .cloned()
            .collect()
    }

    pub(crate) fn record_result(&self, name: &str, output: &str) {
        let mut state = self.state.write();
        state.results.insert(name.to_string(), output.to_string());
        state.completed.insert(name.to_string());
    }

    /// Process a node and traverse its outgoing edges; returns the final
    /// response that propagates outward.
    pub fn execute_node<'a>(
        &'a self,
        name: &'a str,
        input: String,
        responses: &'a ResponseLog,
    ) -> BoxFuture<'a, Result<String, GraphError>> {
        async move {
            let output = self.process_node(name, &input, responses).await?;
            self.traverse_from(name, &output, responses).await
        }
        .boxed()
    }

    /// Dispatch each group of same-pattern outgoing edges to its handler.
    pub(crate) fn traverse_from<'a>(
        &'a self,
        name: &'a str,
        response: &'a str,
        responses: &'a ResponseLog,
    ) -> BoxFuture<'a, Result<String, GraphError>> {
        async move {
            let mut final_response = response.to_string();
            for pattern in EdgePattern::ALL {
                let group = self.edges_from(name, pattern);
                if group.is_empty() {
                    continue;
                }
                final_response = patterns::dispatch(self, pattern, &group, response, responses).await?;
            }
            Ok(final_response)
        }
        .boxed()
    }

    /// Run a single node without edge traversal: optional reasoning
    /// pre-step, the main streaming call, result recording, response
    /// append.
    pub(crate) async fn process_node(
        &self,
        name: &str,
        input: &str,
        responses: &ResponseLog,
    ) -> Result<String, GraphError> {
        let node = self
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::NodeNotFound {
                name: name.to_string(),
            })?;

        let _ = self.events.emit(
            &channels::STEP,
            &StepPayload::new(name, WorkflowStatus::Pending),
        );

        let reasoning = if node.enable_reasoning {
            self.push_record(name, input, "", None, NodeStatus::Reasoning);
            Some(self.process_reasoning_step(&node, input).await?)
        } else {
            None
        };

        let prompt = render_prompt(input, reasoning.as_deref());
        let output = match self.process_agent_message(name, &node, prompt).await {
            Ok(output) => output,
            Err(err) => {
                self.push_record(name, input, "", reasoning.clone(), NodeStatus::Failed);
                let _ = self.events.emit(
                    &channels::STEP,
                    &StepPayload::new(name, WorkflowStatus::Error),
                );
                return Err(err);
            }
        };

        self.record_result(name, &output);
        self.push_record(name, input, &output, reasoning, NodeStatus::Completed);
        responses.push(output.clone());
        let _ = self.events.emit(
            &channels::STEP,
            &StepPayload::new(name, WorkflowStatus::Completed),
        );
        tracing::debug!(node = name, output_len = output.len(), "node completed");
        Ok(output)
    }

    /// Auxiliary LLM pre-pass producing a reasoning trace, streamed on the
    /// `step` channel as a `reasoning` sub-step.
    pub(crate) async fn process_reasoning_step(
        &self,
        node: &AgentNode,
        input: &str,
    ) -> Result<String, GraphError> {
        let _ = self.events.emit(
            &channels::STEP,
            &StepPayload::new(&node.name, WorkflowStatus::Pending).with_sub_step(
                "reasoning",
                Value::Null,
                WorkflowStatus::Pending,
            ),
        );

        let events = self.events.clone();
        let step_id = node.name.clone();
        let buffer = Arc::new(Mutex::new(ChunkBuffer::new(
            STREAM_THRESHOLD,
            vec!["\n".to_string()],
            move |_chunk, full| {
                let _ = events.emit(
                    &channels::STEP,
                    &StepPayload::new(&step_id, WorkflowStatus::Pending).with_sub_step(
                        "reasoning",
                        Value::String(full.to_string()),
                        WorkflowStatus::Pending,
                    ),
                );
            },
        )));
        let stream_buffer = buffer.clone();

        let request = GenerateTextRequest::new(&self.model_name)
            .with_messages(vec![Message::system(&node.system_prompt)])
            .with_prompt(format!(
                "Think step by step about how to respond. Lay out your reasoning before answering.\n\n{input}"
            ))
            .with_cancel(self.cancel.child_token())
            .with_on_reasoning(move |chunk, _full| stream_buffer.lock().push(chunk));

        let trace = self
            .model
            .generate_text(request)
            .await
            .map_err(|source| GraphError::Llm {
                node: node.name.clone(),
                source,
            })?;
        buffer.lock().end();

        let _ = self.events.emit(
            &channels::STEP,
            &StepPayload::new(&node.name, WorkflowStatus::Pending).with_sub_step(
                "reasoning",
                Value::String(trace.clone()),
                WorkflowStatus::Completed,
            ),
        );
        Ok(trace)
    }

    /// The main LLM invocation for a node, streaming chunks to the bus and
    /// looping through tool calls when the output requests one.
    pub(crate) async fn process_agent_message(
        &self,
        node_id: &str,
        node: &AgentNode,
        prompt: String,
    ) -> Result<String, GraphError> {
        let mut messages = vec![Message::system(&node.system_prompt)];
        let mut prompt = prompt;
        let tool_rounds = node.tool_steps.unwrap_or(0);
        let mut round = 0;

        loop {
            let text = self.stream_generation(node_id, node, &messages, &prompt).await?;

            if round >= tool_rounds || node.tools.is_empty() {
                return Ok(text);
            }
            let Some((tool_name, args)) = parse_tool_directive(&text) else {
                return Ok(text);
            };
            if !node.tools.iter().any(|t| t == &tool_name) {
                return Ok(text);
            }

            let tool = self
                .tools
                .get(&tool_name)
                .ok_or_else(|| GraphError::Tool {
                    node: node_id.to_string(),
                    source: ToolError::Unknown {
                        name: tool_name.clone(),
                    },
                })?;
            tracing::debug!(node = node_id, tool = %tool_name, "invoking tool");
            let result = tool
                .invoke(args)
                .await
                .map_err(|source| GraphError::Tool {
                    node: node_id.to_string(),
                    source,
                })?;

            // Tool results feed back into the same node as a follow-up
            // message; the next round answers with them in context.
            messages.push(Message::assistant(&text));
            messages.push(Message::new("tool", &result.to_string()));
            prompt = format!("Use the tool result above to answer:\n\n{prompt}");
            round += 1;
        }
    }

    async fn stream_generation(
        &self,
        node_id: &str,
        node: &AgentNode,
        messages: &[Message],
        prompt: &str,
    ) -> Result<String, GraphError> {
        let events = self.events.clone();
        let step_id = node_id.to_string();
        let is_step = node.is_step;
        let buffer = Arc::new(Mutex::new(ChunkBuffer::new(
            STREAM_THRESHOLD,
            vec![". ".to_string(), "\n".to_string()],
            move |_chunk, full| {
                if is_step {
                    let _ = events.emit(
                        &channels::STEP,
                        &StepPayload::new(&step_id, WorkflowStatus::Pending).with_sub_step(
                            "content",
                            Value::String(full.to_string()),
                            WorkflowStatus::Pending,
                        ),
                    );
                } else {
                    let _ = events.emit(&channels::ANSWER, &AnswerPayload::partial(full));
                }
            },
        )));
        let stream_buffer = buffer.clone();

        let mut request = GenerateTextRequest::new(&self.model_name)
            .with_messages(messages.to_vec())
            .with_prompt(prompt)
            .with_cancel(self.cancel.child_token())
            .with_on_chunk(move |chunk, _full| stream_buffer.lock().push(chunk));
        if let Some(temperature) = node.temperature {
            request = request.with_temperature(temperature);
        }

        let text = self
            .model
            .generate_text(request)
            .await
            .map_err(|source| GraphError::Llm {
                node: node_id.to_string(),
                source,
            })?;
        buffer.lock().end();
        Ok(text)
    }

    /// Run an edge invocation with fallback routing: on failure, execute
    /// the edge's configured fallback node instead of aborting the graph.
    pub(crate) async fn with_fallback<'a, F>(
        &'a self,
        edge: &'a Edge,
        input: &'a str,
        responses: &'a ResponseLog,
        run: F,
    ) -> Result<String, GraphError>
    where
        F: std::future::Future<Output = Result<String, GraphError>> + Send + 'a,
    {
        match run.await {
            Ok(output) => Ok(output),
            Err(err) => match &edge.config.fallback {
                Some(fallback) => {
                    tracing::warn!(
                        to = %edge.to,
                        fallback = %fallback,
                        error = %err,
                        "edge invocation failed; routing to fallback node"
                    );
                    self.execute_node(fallback, input.to_string(), responses).await
                }
                None => Err(err),
            },
        }
    }

    /// Evaluate a stop condition against the latest response.
    pub(crate) async fn should_stop(
        &self,
        stop: Option<&StopCondition>,
        current_response: &str,
        responses: &ResponseLog,
    ) -> bool {
        match stop {
            None => false,
            Some(StopCondition::MaxResponses(max)) => responses.len() >= *max,
            Some(StopCondition::Predicate(predicate)) => {
                predicate(current_response.to_string()).await
            }
        }
    }

    fn push_record(
        &self,
        name: &str,
        input: &str,
        output: &str,
        reasoning: Option<String>,
        status: NodeStatus,
    ) {
        self.state.write().node_states.push(NodeStateRecord {
            name: name.to_string(),
            input: input.to_string(),
            output: output.to_string(),
            reasoning,
            status,
        });
    }
}

impl std::fmt::Debug for AgentGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentGraph")
            .field("model_name", &self.model_name)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges.len())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn render_prompt(input: &str, reasoning: Option<&str>) -> String {
    match reasoning {
        Some(trace) => format!("Prior reasoning:\n{trace}\n\n{input}"),
        None => input.to_string(),
    }
}

/// Detect a tool call in model output: a JSON object (optionally fenced)
/// with a `tool` name and optional `args`.
fn parse_tool_directive(text: &str) -> Option<(String, Value)> {
    let mut candidate = text.trim();
    if let Some(stripped) = candidate.strip_prefix("```json") {
        candidate = stripped.trim_end_matches("```").trim();
    } else if let Some(stripped) = candidate.strip_prefix("```") {
        candidate = stripped.trim_end_matches("```").trim();
    }
    let value: Value = serde_json::from_str(candidate).ok()?;
    let tool = value.get("tool")?.as_str()?.to_string();
    let args = value.get("args").cloned().unwrap_or(Value::Null);
    Some((tool, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_and_fenced_tool_directives() {
        let (tool, args) =
            parse_tool_directive(r#"{"tool": "web_search", "args": {"q": "rust"}}"#).unwrap();
        assert_eq!(tool, "web_search");
        assert_eq!(args, json!({"q": "rust"}));

        let fenced = "```json\n{\"tool\": \"chart\"}\n```";
        let (tool, args) = parse_tool_directive(fenced).unwrap();
        assert_eq!(tool, "chart");
        assert_eq!(args, Value::Null);

        assert!(parse_tool_directive("plain prose answer").is_none());
        assert!(parse_tool_directive(r#"{"args": {}}"#).is_none());
    }

    #[test]
    fn render_prompt_prefixes_reasoning() {
        assert_eq!(render_prompt("question", None), "question");
        let rendered = render_prompt("question", Some("trace"));
        assert!(rendered.starts_with("Prior reasoning:\ntrace"));
        assert!(rendered.ends_with("question"));
    }

    #[test]
    fn response_log_accumulates() {
        let log = ResponseLog::new();
        assert!(log.is_empty());
        log.push("a".into());
        log.push("b".into());
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries(), vec!["a".to_string(), "b".to_string()]);
    }
}
