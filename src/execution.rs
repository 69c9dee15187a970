//! Per-workflow mutable execution state.
//!
//! [`ExecutionContext`] tracks which tasks have completed or are in flight,
//! the last result of each task, completion counters, timing records, abort
//! flags and the optional breakpoint marker. It is owned by exactly one
//! workflow; tasks receive a cheap clone sharing the same state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event_bus::{channels, EventBus, TaskExecutionPayload};

/// Outcome of a single task attempt.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimingStatus {
    Success,
    Failed,
}

/// One timing record per task attempt.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskTiming {
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TimingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskTiming {
    fn started_now() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: None,
            error: None,
        }
    }
}

/// A durable pause point created by a task to yield control.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointMarker {
    pub id: String,
    pub task_name: String,
    pub data: Value,
}

/// Serde-friendly snapshot of the execution state, decoupled from the
/// in-memory representation for the persistence layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub completed_tasks: FxHashSet<String>,
    pub running_tasks: FxHashSet<String>,
    pub task_data: FxHashMap<String, Value>,
    pub execution_counts: FxHashMap<String, u32>,
    pub timings: FxHashMap<String, Vec<TaskTiming>>,
    pub aborted: bool,
    pub graceful_shutdown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<BreakpointMarker>,
}

#[derive(Default)]
struct ExecutionInner {
    completed: FxHashSet<String>,
    running: FxHashSet<String>,
    task_data: FxHashMap<String, Value>,
    execution_counts: FxHashMap<String, u32>,
    timings: FxHashMap<String, Vec<TaskTiming>>,
    aborted: bool,
    graceful_shutdown: bool,
    breakpoint: Option<BreakpointMarker>,
}

/// Handle to one workflow's execution state.
///
/// Invariants maintained here:
/// - a task name is in the running set exactly while its `execute` is in
///   flight;
/// - the execution count of a task equals the number of times it has moved
///   into the completed set (including re-entries after
///   [`reset_task_completion`](Self::reset_task_completion));
/// - once aborted non-gracefully, the engine schedules nothing further.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<RwLock<ExecutionInner>>,
    events: EventBus,
}

impl ExecutionContext {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ExecutionInner::default())),
            events,
        }
    }

    /// Move a task from running to completed, record its result, bump the
    /// counter and emit a `taskExecution` event.
    pub fn mark_task_complete(&self, name: &str, data: Value) {
        let count = {
            let mut inner = self.inner.write();
            inner.running.remove(name);
            inner.completed.insert(name.to_string());
            inner.task_data.insert(name.to_string(), data);
            let count = inner.execution_counts.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let _ = self.events.emit(
            &channels::TASK_EXECUTION,
            &TaskExecutionPayload {
                task_name: name.to_string(),
                count,
            },
        );
    }

    /// Remove a task from the completed set. Required before re-executing a
    /// task that a loop routes back to; without the reset the loop silently
    /// stops at the re-entrancy checks.
    pub fn reset_task_completion(&self, name: &str) {
        self.inner.write().completed.remove(name);
    }

    pub fn set_task_running(&self, name: &str) {
        self.inner.write().running.insert(name.to_string());
    }

    pub fn finish_task_running(&self, name: &str) {
        self.inner.write().running.remove(name);
    }

    pub fn is_task_running(&self, name: &str) -> bool {
        self.inner.read().running.contains(name)
    }

    pub fn is_task_complete(&self, name: &str) -> bool {
        self.inner.read().completed.contains(name)
    }

    pub fn get_task_execution_count(&self, name: &str) -> u32 {
        self.inner
            .read()
            .execution_counts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a task has completed at least `max` times.
    pub fn has_reached_max_runs(&self, name: &str, max: u32) -> bool {
        self.get_task_execution_count(name) >= max
    }

    /// The last recorded result for a task.
    pub fn task_data(&self, name: &str) -> Option<Value> {
        self.inner.read().task_data.get(name).cloned()
    }

    /// Append a fresh timing record for an attempt.
    pub fn start_task_timing(&self, name: &str) {
        self.inner
            .write()
            .timings
            .entry(name.to_string())
            .or_default()
            .push(TaskTiming::started_now());
    }

    /// Close the latest open timing record. A supplied error marks the
    /// attempt failed.
    pub fn end_task_timing(&self, name: &str, error: Option<&str>) {
        let mut inner = self.inner.write();
        if let Some(timing) = inner
            .timings
            .get_mut(name)
            .and_then(|records| records.iter_mut().rev().find(|t| t.end_time.is_none()))
        {
            let now = Utc::now();
            timing.end_time = Some(now);
            timing.duration_ms = Some((now - timing.start_time).num_milliseconds());
            timing.status = Some(if error.is_some() {
                TimingStatus::Failed
            } else {
                TimingStatus::Success
            });
            timing.error = error.map(str::to_string);
        }
    }

    /// Timing records for one task, in attempt order.
    pub fn task_timings(&self, name: &str) -> Vec<TaskTiming> {
        self.inner.read().timings.get(name).cloned().unwrap_or_default()
    }

    pub fn abort_workflow(&self, graceful: bool) {
        let mut inner = self.inner.write();
        inner.aborted = true;
        inner.graceful_shutdown = graceful;
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.read().aborted
    }

    pub fn is_graceful_shutdown(&self) -> bool {
        self.inner.read().graceful_shutdown
    }

    pub fn set_breakpoint(&self, marker: BreakpointMarker) {
        self.inner.write().breakpoint = Some(marker);
    }

    pub fn breakpoint(&self) -> Option<BreakpointMarker> {
        self.inner.read().breakpoint.clone()
    }

    pub fn clear_breakpoint(&self) {
        self.inner.write().breakpoint = None;
    }

    /// Per-task human-readable timing summaries.
    pub fn task_timing_summary(&self) -> FxHashMap<String, String> {
        let inner = self.inner.read();
        inner
            .timings
            .iter()
            .map(|(name, records)| {
                let attempts = records.len();
                let failures = records
                    .iter()
                    .filter(|t| t.status == Some(TimingStatus::Failed))
                    .count();
                let total: i64 = records.iter().filter_map(|t| t.duration_ms).sum();
                let finished = records.iter().filter(|t| t.duration_ms.is_some()).count();
                let average = if finished > 0 {
                    total / finished as i64
                } else {
                    0
                };
                (
                    name.clone(),
                    format!(
                        "total {total}ms over {attempts} attempt(s), {failures} failed, avg {average}ms"
                    ),
                )
            })
            .collect()
    }

    /// Workflow-level aggregate: total runs, failures, slowest task, the
    /// task with the most failures, and overall status.
    pub fn main_timing_summary(&self) -> String {
        let inner = self.inner.read();
        let total_runs: usize = inner.timings.values().map(Vec::len).sum();
        let total_failures: usize = inner
            .timings
            .values()
            .flatten()
            .filter(|t| t.status == Some(TimingStatus::Failed))
            .count();
        let slowest = inner
            .timings
            .iter()
            .filter_map(|(name, records)| {
                records
                    .iter()
                    .filter_map(|t| t.duration_ms)
                    .max()
                    .map(|ms| (name.clone(), ms))
            })
            .max_by_key(|(_, ms)| *ms);
        let most_failing = inner
            .timings
            .iter()
            .map(|(name, records)| {
                let failures = records
                    .iter()
                    .filter(|t| t.status == Some(TimingStatus::Failed))
                    .count();
                (name.clone(), failures)
            })
            .filter(|(_, failures)| *failures > 0)
            .max_by_key(|(_, failures)| *failures);

        let status = if inner.aborted {
            "aborted"
        } else if total_failures > 0 {
            "completed with failures"
        } else {
            "completed"
        };

        let mut summary = format!("{total_runs} run(s), {total_failures} failure(s), status: {status}");
        if let Some((name, ms)) = slowest {
            summary.push_str(&format!("; slowest: {name} ({ms}ms)"));
        }
        if let Some((name, failures)) = most_failing {
            summary.push_str(&format!("; most failures: {name} ({failures})"));
        }
        summary
    }

    /// Capture the full state for persistence.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let inner = self.inner.read();
        ExecutionSnapshot {
            completed_tasks: inner.completed.clone(),
            running_tasks: inner.running.clone(),
            task_data: inner.task_data.clone(),
            execution_counts: inner.execution_counts.clone(),
            timings: inner.timings.clone(),
            aborted: inner.aborted,
            graceful_shutdown: inner.graceful_shutdown,
            breakpoint: inner.breakpoint.clone(),
        }
    }

    /// Replace the state from a persisted snapshot. Tasks recorded as
    /// running at capture time are not running anymore after a restart.
    pub fn restore(&self, snapshot: ExecutionSnapshot) {
        let mut inner = self.inner.write();
        inner.completed = snapshot.completed_tasks;
        inner.running = FxHashSet::default();
        inner.task_data = snapshot.task_data;
        inner.execution_counts = snapshot.execution_counts;
        inner.timings = snapshot.timings;
        inner.aborted = snapshot.aborted;
        inner.graceful_shutdown = snapshot.graceful_shutdown;
        inner.breakpoint = snapshot.breakpoint;
    }
}
