//! Workflow engine: task registry, scheduler and persistence hand-off.
//!
//! The engine executes a directed graph of asynchronous tasks. Each task
//! runs with dependency gating, a retry loop with exponential backoff, an
//! optional timeout race and an error-handler ladder; successors resolve
//! from the imperative redirect, the task's returned route, or its router,
//! in that order. Snapshots go to the configured [`PersistenceLayer`] after
//! every boundary, so breakpoints and aborts are durable.

pub mod config;
#[allow(clippy::module_inception)]
mod engine;
pub mod persistence;
#[cfg(feature = "sqlite")]
pub mod persistence_sqlite;
pub mod task;

pub use config::{WorkflowConfig, WorkflowConfigSnapshot};
pub use engine::{EngineError, WorkflowEngine};
pub use persistence::{
    map_to_value, set_to_value, value_to_map, value_to_set, InMemoryPersistence, PersistenceError,
    PersistenceLayer, StoredWorkflow, WorkflowSnapshot,
};
#[cfg(feature = "sqlite")]
pub use persistence_sqlite::{default_database_name, SqlitePersistence};
pub use task::{
    ErrorDecision, ErrorHandler, FanoutTarget, Route, Router, Task, TaskError, TaskOutput,
    TaskParams, TaskSpec,
};
