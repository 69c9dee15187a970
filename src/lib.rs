//! ```text
//! WorkflowEngine ─┬─► execute_task ─► Task (attempt loop, timeout, retry)
//!                 │                    │
//!                 │                    ├─► TypedContext (shared key/value)
//!                 │                    ├─► EventBus (channels / sinks / UI)
//!                 │                    └─► Route ─► successors (fan-out)
//!                 │
//!                 ├─► PersistenceLayer (snapshot / breakpoint / resume)
//!                 │
//!                 └─► AgentGraph ─► edge patterns ─► LanguageModel streaming
//! ```
//!
//! taskloom is a runtime for directed graphs of asynchronous agent tasks.
//! Tasks stream model output, emit progress events, read and write a shared
//! typed context, and route control to successor tasks; the agent-graph layer
//! composes nodes with higher-level patterns (sequential, parallel,
//! condition, map, reduce, loop, revision) on the same primitives.

pub mod chunk;
pub mod context;
pub mod engine;
pub mod event_bus;
pub mod execution;
pub mod graph;
pub mod llm;
pub mod message;
pub mod tasks;
pub mod telemetry;
