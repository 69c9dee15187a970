//! Agent-graph layer: node and edge registries plus the traversal driver.
//!
//! Built on the same primitives as the workflow engine (event bus, chunk
//! buffer, LLM capability, cancellation signal). Node execution streams
//! model output; outgoing edges dispatch by pattern.

pub mod edge;
pub mod executor;
pub mod node;
mod patterns;

pub use edge::{
    ConditionInput, Edge, EdgeCondition, EdgeConfig, EdgePattern, InputTransform, OutputTransform,
    RevisionPrompt, StopCondition,
};
pub use executor::{AgentGraph, GraphError, ResponseLog};
pub use node::{AgentNode, GraphExecutionState, NodeStateRecord, NodeStatus};
