use std::sync::Arc;

use futures_util::future::{ready, BoxFuture, FutureExt};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// The control-flow semantics of an edge.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EdgePattern {
    Sequential,
    Parallel,
    Condition,
    Map,
    Reduce,
    Loop,
    Revision,
}

impl EdgePattern {
    /// Dispatch order when a node carries edges of several patterns.
    pub const ALL: [EdgePattern; 7] = [
        EdgePattern::Sequential,
        EdgePattern::Parallel,
        EdgePattern::Condition,
        EdgePattern::Map,
        EdgePattern::Reduce,
        EdgePattern::Loop,
        EdgePattern::Revision,
    ];
}

/// Input handed to condition and revision-prompt closures: the current
/// response and every node result recorded so far.
#[derive(Clone, Debug)]
pub struct ConditionInput<'a> {
    pub response: &'a str,
    pub results: &'a FxHashMap<String, String>,
}

/// Predicate deciding whether a conditional edge fires.
pub type EdgeCondition = Arc<dyn Fn(&ConditionInput<'_>) -> bool + Send + Sync>;

/// Turns a response into the per-element inputs of a map edge.
pub type InputTransform = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Combines several outputs into one (map and reduce edges).
pub type OutputTransform = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

/// Builds the next revision prompt from the current state.
pub type RevisionPrompt = Arc<dyn Fn(&ConditionInput<'_>) -> String + Send + Sync>;

/// Early-halt policy for loop and revision edges: a fixed response
/// threshold, or a (possibly async) predicate over the latest response.
#[derive(Clone)]
pub enum StopCondition {
    MaxResponses(usize),
    Predicate(Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>),
}

impl StopCondition {
    /// Wrap a synchronous predicate.
    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        StopCondition::Predicate(Arc::new(move |response| ready(f(&response)).boxed()))
    }

    /// Use an async predicate directly.
    pub fn async_predicate(
        f: impl Fn(String) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    ) -> Self {
        StopCondition::Predicate(Arc::new(f))
    }
}

impl std::fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopCondition::MaxResponses(n) => f.debug_tuple("MaxResponses").field(n).finish(),
            StopCondition::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Pattern-specific edge configuration. All fields are optional; each
/// pattern reads the ones it understands.
#[derive(Clone, Default)]
pub struct EdgeConfig {
    /// Ordering for sequential edges (ascending).
    pub priority: i32,
    /// Iteration cap for loop and revision edges; the graph default
    /// applies when unset.
    pub max_iterations: Option<u32>,
    /// Node to route to when this edge's invocation fails.
    pub fallback: Option<String>,
    pub condition: Option<EdgeCondition>,
    pub input_transform: Option<InputTransform>,
    pub output_transform: Option<OutputTransform>,
    pub stop_condition: Option<StopCondition>,
    pub revision_prompt: Option<RevisionPrompt>,
}

impl EdgeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    #[must_use]
    pub fn with_condition(
        mut self,
        condition: impl Fn(&ConditionInput<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    #[must_use]
    pub fn with_input_transform(
        mut self,
        transform: impl Fn(&str) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.input_transform = Some(Arc::new(transform));
        self
    }

    #[must_use]
    pub fn with_output_transform(
        mut self,
        transform: impl Fn(&[String]) -> String + Send + Sync + 'static,
    ) -> Self {
        self.output_transform = Some(Arc::new(transform));
        self
    }

    #[must_use]
    pub fn with_stop_condition(mut self, stop: StopCondition) -> Self {
        self.stop_condition = Some(stop);
        self
    }

    #[must_use]
    pub fn with_revision_prompt(
        mut self,
        prompt: impl Fn(&ConditionInput<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.revision_prompt = Some(Arc::new(prompt));
        self
    }
}

impl std::fmt::Debug for EdgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeConfig")
            .field("priority", &self.priority)
            .field("max_iterations", &self.max_iterations)
            .field("fallback", &self.fallback)
            .field("has_condition", &self.condition.is_some())
            .field("has_input_transform", &self.input_transform.is_some())
            .field("has_output_transform", &self.output_transform.is_some())
            .field("stop_condition", &self.stop_condition)
            .field("has_revision_prompt", &self.revision_prompt.is_some())
            .finish()
    }
}

/// A directed connection between two nodes, annotated with a pattern.
#[derive(Clone, Debug)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub pattern: EdgePattern,
    pub config: EdgeConfig,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, pattern: EdgePattern) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            pattern,
            config: EdgeConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EdgeConfig) -> Self {
        self.config = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_predicate_wraps_into_future() {
        let stop = StopCondition::predicate(|response| response.contains("done"));
        match stop {
            StopCondition::Predicate(f) => {
                assert!(f("all done".to_string()).await);
                assert!(!f("keep going".to_string()).await);
            }
            _ => panic!("expected predicate"),
        }
    }

    #[test]
    fn pattern_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(EdgePattern::Revision).unwrap(),
            serde_json::json!("revision")
        );
    }

    #[test]
    fn edge_config_builder() {
        let config = EdgeConfig::new()
            .with_priority(3)
            .with_fallback("rescue")
            .with_max_iterations(4);
        assert_eq!(config.priority, 3);
        assert_eq!(config.fallback.as_deref(), Some("rescue"));
        assert_eq!(config.max_iterations, Some(4));
    }
}
