use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire channel names consumed by the outer (UI/SSE) layer.
///
/// Spellings are part of the external contract and must not be renamed.
pub mod channels {
    use super::{
        AnswerPayload, EventChannel, SourceItem, StatusPayload, StepPayload, TaskExecutionPayload,
    };

    /// Workflow-level status transitions.
    pub const STATUS: EventChannel<StatusPayload> = EventChannel::new("status");
    /// Streaming answer text.
    pub const ANSWER: EventChannel<AnswerPayload> = EventChannel::new("answer");
    /// Pipeline step progress, including reasoning sub-steps.
    pub const STEP: EventChannel<StepPayload> = EventChannel::new("step");
    /// Search results surfaced to the client.
    pub const SOURCES: EventChannel<Vec<SourceItem>> = EventChannel::new("sources");
    /// Follow-up suggestions.
    pub const SUGGESTIONS: EventChannel<Vec<String>> = EventChannel::new("suggestions");
    /// Task completion counters.
    pub const TASK_EXECUTION: EventChannel<TaskExecutionPayload> = EventChannel::new("taskExecution");
}

/// A named event channel tied to a payload type, mirroring
/// [`ContextKey`](crate::context::ContextKey).
pub struct EventChannel<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EventChannel<T> {
    /// Declare a channel with the given wire name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// The channel's wire name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EventChannel<T> {}

/// A single emission on the bus: channel name, payload, timestamp.
///
/// When the outer layer streams events to a client, each one becomes a
/// server-sent-event message; the payload shapes below are what it
/// serializes alongside its own framing fields (`type`, `threadId`,
/// `threadItemId`, `parentThreadItemId`, credit headers).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    pub channel: String,
    pub payload: Value,
    pub when: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
            when: Utc::now(),
        }
    }
}

impl std::fmt::Display for BusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.channel, self.payload)
    }
}

/// Workflow status taxonomy surfaced on the `status` channel and inside
/// answer payloads.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Completed,
    Error,
    Aborted,
}

/// Payload for the `status` channel. The terminal emission carries a
/// message on failure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPayload {
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusPayload {
    pub fn new(status: WorkflowStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    pub fn with_message(status: WorkflowStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// Payload for the `answer` channel.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    pub status: Option<WorkflowStatus>,
}

impl AnswerPayload {
    /// A streaming (partial) answer emission.
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            final_text: None,
            status: Some(WorkflowStatus::Pending),
        }
    }

    /// The terminal answer emission.
    pub fn completed(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            final_text: Some(text.clone()),
            text,
            status: Some(WorkflowStatus::Completed),
        }
    }
}

/// A sub-step inside a pipeline step (e.g. a reasoning pre-pass).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubStep {
    pub data: Value,
    pub status: WorkflowStatus,
}

/// Payload for the `step` channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepPayload {
    pub step_id: String,
    pub step_status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub sub_steps: FxHashMap<String, SubStep>,
}

impl StepPayload {
    pub fn new(step_id: impl Into<String>, step_status: WorkflowStatus) -> Self {
        Self {
            step_id: step_id.into(),
            step_status,
            sub_steps: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_sub_step(mut self, name: impl Into<String>, data: Value, status: WorkflowStatus) -> Self {
        self.sub_steps.insert(name.into(), SubStep { data, status });
        self
    }
}

/// A single search result on the `sources` channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceItem {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

/// Payload for the `taskExecution` channel, emitted whenever a task
/// completes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionPayload {
    pub task_name: String,
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_screaming() {
        let payload = StatusPayload::new(WorkflowStatus::Pending);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"status": "PENDING"})
        );
        let payload = StatusPayload::with_message(WorkflowStatus::Error, "boom");
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"status": "ERROR", "message": "boom"})
        );
    }

    #[test]
    fn task_execution_uses_camel_case() {
        let payload = TaskExecutionPayload {
            task_name: "writer".into(),
            count: 2,
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"taskName": "writer", "count": 2})
        );
    }

    #[test]
    fn completed_answer_carries_final_text() {
        let payload = AnswerPayload::completed("done");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["finalText"], json!("done"));
        assert_eq!(value["status"], json!("COMPLETED"));
    }
}
