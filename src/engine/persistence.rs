/*!
Persistence primitives for serializing/deserializing workflow state.

Design goals:
- Serde-friendly snapshot shapes decoupled from the in-memory state, so
  backends stay lean and declarative.
- Keep the legacy collection envelope: sets serialize as
  `{"type":"Set","value":[…]}` and maps as `{"type":"Map","value":{…}}`,
  arrays and plain objects recurse, primitives pass through. Existing
  persisted data depends on this shape.

This module does not perform I/O; backends implement [`PersistenceLayer`].
*/

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::context::TypedContext;
use crate::engine::config::{WorkflowConfig, WorkflowConfigSnapshot};
use crate::event_bus::EventBus;
use crate::execution::{BreakpointMarker, ExecutionContext, ExecutionSnapshot, TaskTiming};

/// Errors from snapshot encoding/decoding and persistence backends.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("missing persisted field: {0}")]
    #[diagnostic(
        code(taskloom::persistence::missing_field),
        help("Populate the field in the persisted JSON before conversion.")
    )]
    MissingField(&'static str),

    #[error("malformed collection envelope: expected {expected}")]
    #[diagnostic(
        code(taskloom::persistence::envelope),
        help("Sets serialize as {{\"type\":\"Set\",\"value\":[…]}} and maps as {{\"type\":\"Map\",\"value\":{{…}}}}.")
    )]
    Envelope { expected: &'static str },

    #[error("JSON serialization/deserialization failed: {source}")]
    #[diagnostic(code(taskloom::persistence::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    #[error("persistence backend error: {message}")]
    #[diagnostic(code(taskloom::persistence::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/* ---------- Collection envelope codec ---------- */

/// Encode a set of names into the `{"type":"Set","value":[…]}` envelope.
/// Entries are sorted so snapshots are deterministic.
#[must_use]
pub fn set_to_value(set: &FxHashSet<String>) -> Value {
    let mut entries: Vec<&String> = set.iter().collect();
    entries.sort();
    json!({"type": "Set", "value": entries})
}

/// Decode the set envelope.
pub fn value_to_set(value: &Value) -> Result<FxHashSet<String>> {
    let entries = envelope_value(value, "Set")?
        .as_array()
        .ok_or(PersistenceError::Envelope { expected: "Set" })?;
    entries
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or(PersistenceError::Envelope { expected: "Set" })
        })
        .collect()
}

/// Encode a string-keyed map into the `{"type":"Map","value":{…}}` envelope.
#[must_use]
pub fn map_to_value(map: &FxHashMap<String, Value>) -> Value {
    let entries: Map<String, Value> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    json!({"type": "Map", "value": entries})
}

/// Decode the map envelope.
pub fn value_to_map(value: &Value) -> Result<FxHashMap<String, Value>> {
    let entries = envelope_value(value, "Map")?
        .as_object()
        .ok_or(PersistenceError::Envelope { expected: "Map" })?;
    Ok(entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn envelope_value<'a>(value: &'a Value, expected: &'static str) -> Result<&'a Value> {
    let obj = value
        .as_object()
        .ok_or(PersistenceError::Envelope { expected })?;
    if obj.get("type").and_then(Value::as_str) != Some(expected) {
        return Err(PersistenceError::Envelope { expected });
    }
    obj.get("value")
        .ok_or(PersistenceError::Envelope { expected })
}

/* ---------- Snapshot shapes ---------- */

/// Durable snapshot of one workflow, the unit a backend saves and loads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    /// Envelope-encoded execution state (sets, task data map, flags,
    /// breakpoint).
    pub workflow_state: Value,
    pub event_state: FxHashMap<String, Value>,
    pub context_state: FxHashMap<String, Value>,
    pub execution_counts: FxHashMap<String, u32>,
    pub task_timings: FxHashMap<String, Vec<TaskTiming>>,
    pub workflow_config: WorkflowConfigSnapshot,
    /// RFC3339 capture time (keeps `chrono::DateTime` out of the wire
    /// shape).
    pub last_updated: String,
}

impl WorkflowSnapshot {
    /// Capture the live state of a workflow.
    #[must_use]
    pub fn capture(
        execution: &ExecutionContext,
        events: &EventBus,
        context: &TypedContext,
        config: &WorkflowConfig,
    ) -> Self {
        let exec = execution.snapshot();
        Self {
            workflow_state: encode_execution_state(&exec),
            event_state: events.all_state(),
            context_state: context.snapshot(),
            execution_counts: exec.execution_counts,
            task_timings: exec.timings,
            workflow_config: WorkflowConfigSnapshot::from(config),
            last_updated: Utc::now().to_rfc3339(),
        }
    }

    /// Rebuild the execution snapshot from the envelope-encoded state plus
    /// the separately stored counts and timings.
    pub fn decode_execution(&self) -> Result<ExecutionSnapshot> {
        let state = self
            .workflow_state
            .as_object()
            .ok_or(PersistenceError::MissingField("workflowState"))?;
        let completed = value_to_set(
            state
                .get("completedTasks")
                .ok_or(PersistenceError::MissingField("completedTasks"))?,
        )?;
        let running = value_to_set(
            state
                .get("runningTasks")
                .ok_or(PersistenceError::MissingField("runningTasks"))?,
        )?;
        let task_data = value_to_map(
            state
                .get("taskData")
                .ok_or(PersistenceError::MissingField("taskData"))?,
        )?;
        let breakpoint = match state.get("breakpoint") {
            None | Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value::<BreakpointMarker>(value.clone())?),
        };
        Ok(ExecutionSnapshot {
            completed_tasks: completed,
            running_tasks: running,
            task_data,
            execution_counts: self.execution_counts.clone(),
            timings: self.task_timings.clone(),
            aborted: state
                .get("aborted")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            graceful_shutdown: state
                .get("gracefulShutdown")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            breakpoint,
        })
    }
}

fn encode_execution_state(exec: &ExecutionSnapshot) -> Value {
    json!({
        "completedTasks": set_to_value(&exec.completed_tasks),
        "runningTasks": set_to_value(&exec.running_tasks),
        "taskData": map_to_value(&exec.task_data),
        "aborted": exec.aborted,
        "gracefulShutdown": exec.graceful_shutdown,
        "breakpoint": exec.breakpoint.as_ref().map(|bp| json!({
            "id": bp.id,
            "taskName": bp.task_name,
            "data": bp.data,
        })),
    })
}

/* ---------- Backend capability ---------- */

/// Capability required by the engine: durable save/load of snapshots keyed
/// by workflow id.
#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    async fn save(&self, workflow_id: &str, snapshot: WorkflowSnapshot) -> Result<()>;
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>>;
}

/// A stored workflow row, with backend-managed timestamps.
#[derive(Clone, Debug)]
pub struct StoredWorkflow {
    pub snapshot: WorkflowSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Volatile persistence for tests and development.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    records: Arc<RwLock<FxHashMap<String, StoredWorkflow>>>,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored workflow ids.
    #[must_use]
    pub fn list_workflows(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    /// The full stored row, including timestamps.
    #[must_use]
    pub fn stored(&self, workflow_id: &str) -> Option<StoredWorkflow> {
        self.records.read().get(workflow_id).cloned()
    }
}

#[async_trait]
impl PersistenceLayer for InMemoryPersistence {
    async fn save(&self, workflow_id: &str, snapshot: WorkflowSnapshot) -> Result<()> {
        let mut records = self.records.write();
        let now = Utc::now();
        match records.get_mut(workflow_id) {
            Some(existing) => {
                existing.snapshot = snapshot;
                existing.updated_at = now;
            }
            None => {
                records.insert(
                    workflow_id.to_string(),
                    StoredWorkflow {
                        snapshot,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>> {
        Ok(self
            .records
            .read()
            .get(workflow_id)
            .map(|stored| stored.snapshot.clone()))
    }
}
