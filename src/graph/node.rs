use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// An agent-graph node: a prompt template plus LLM invocation policy.
///
/// # Examples
///
/// ```
/// use taskloom::graph::AgentNode;
///
/// let researcher = AgentNode::new("researcher", "research assistant", "Collect facts about: {input}")
///     .with_temperature(0.2)
///     .with_tools(["web_search"], 3)
///     .with_reasoning();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentNode {
    pub name: String,
    pub role: String,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum tool-call rounds for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_steps: Option<u32>,
    /// Names of tools this node may invoke.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    /// Run an auxiliary reasoning pre-pass before the main call.
    #[serde(default)]
    pub enable_reasoning: bool,
    /// Emit streaming content on the `step` channel instead of `answer`.
    #[serde(default)]
    pub is_step: bool,
}

impl AgentNode {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            system_prompt: system_prompt.into(),
            temperature: None,
            tool_steps: None,
            tools: Vec::new(),
            enable_reasoning: false,
            is_step: false,
        }
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_tools<I, S>(mut self, tools: I, tool_steps: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self.tool_steps = Some(tool_steps);
        self
    }

    #[must_use]
    pub fn with_reasoning(mut self) -> Self {
        self.enable_reasoning = true;
        self
    }

    #[must_use]
    pub fn as_step(mut self) -> Self {
        self.is_step = true;
        self
    }
}

/// Lifecycle of one node execution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Reasoning,
    Completed,
    Failed,
}

/// One entry in the graph's execution trace.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateRecord {
    pub name: String,
    pub input: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub status: NodeStatus,
}

/// Mutable traversal state of one graph run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphExecutionState {
    /// Final output recorded per node.
    pub results: FxHashMap<String, String>,
    /// Nodes that have completed at least once.
    pub completed: FxHashSet<String>,
    /// Ordered trace of node executions.
    pub node_states: Vec<NodeStateRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_policy_fields() {
        let node = AgentNode::new("writer", "essay writer", "Write about {input}")
            .with_temperature(0.7)
            .with_tools(["search", "chart"], 2)
            .with_reasoning()
            .as_step();
        assert_eq!(node.tools, vec!["search", "chart"]);
        assert_eq!(node.tool_steps, Some(2));
        assert!(node.enable_reasoning);
        assert!(node.is_step);
    }

    #[test]
    fn node_serializes_camel_case() {
        let node = AgentNode::new("a", "r", "p").with_reasoning();
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["systemPrompt"], serde_json::json!("p"));
        assert_eq!(value["enableReasoning"], serde_json::json!(true));
    }
}
