use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::{ContextError, TypedContext};
use crate::engine::config::WorkflowConfig;
use crate::engine::persistence::{PersistenceError, PersistenceLayer, WorkflowSnapshot};
use crate::event_bus::EventBus;
use crate::execution::{BreakpointMarker, ExecutionContext};
use crate::llm::{LlmError, ToolError};

/// Where control flows after a task completes.
///
/// `None` from a router means terminal; the explicit [`Route::End`] halts
/// even when a default successor exists elsewhere.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// Explicit terminal, the `"end"` sentinel.
    End,
    /// A single successor, executed sequentially.
    Next(String),
    /// Parallel fan-out, optionally with per-destination data.
    Fanout(Vec<FanoutTarget>),
}

/// One destination of a parallel fan-out. Without `data`, the destination
/// receives the source task's result.
#[derive(Clone, Debug, PartialEq)]
pub struct FanoutTarget {
    pub task: String,
    pub data: Option<Value>,
}

impl FanoutTarget {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            data: None,
        }
    }

    pub fn with_data(task: impl Into<String>, data: Value) -> Self {
        Self {
            task: task.into(),
            data: Some(data),
        }
    }
}

impl Route {
    /// Parse the `"end"` sentinel, otherwise a task name.
    pub fn next(destination: impl Into<String>) -> Self {
        let destination = destination.into();
        if destination == "end" {
            Route::End
        } else {
            Route::Next(destination)
        }
    }

    /// Fan out to several tasks, all receiving the source result.
    pub fn fanout<I, S>(tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Route::Fanout(tasks.into_iter().map(FanoutTarget::new).collect())
    }
}

impl From<&str> for Route {
    fn from(destination: &str) -> Self {
        Route::next(destination)
    }
}

impl From<Vec<FanoutTarget>> for Route {
    fn from(targets: Vec<FanoutTarget>) -> Self {
        Route::Fanout(targets)
    }
}

/// What a task returns: either a bare result or a result paired with an
/// explicit successor route.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutput {
    Value(Value),
    Routed { result: Value, next: Route },
}

impl TaskOutput {
    pub fn value(result: impl Into<Value>) -> Self {
        TaskOutput::Value(result.into())
    }

    pub fn routed(result: impl Into<Value>, next: impl Into<Route>) -> Self {
        TaskOutput::Routed {
            result: result.into(),
            next: next.into(),
        }
    }

    pub(crate) fn into_parts(self) -> (Value, Option<Route>) {
        match self {
            TaskOutput::Value(result) => (result, None),
            TaskOutput::Routed { result, next } => (result, Some(next)),
        }
    }
}

impl From<Value> for TaskOutput {
    fn from(result: Value) -> Self {
        TaskOutput::Value(result)
    }
}

/// Errors produced by task execution.
#[derive(Debug, Error, Diagnostic)]
pub enum TaskError {
    /// Sentinel raised by [`TaskParams::interrupt`]: the breakpoint was
    /// already persisted, the attempt loop unwinds cleanly and never
    /// surfaces this as a failure.
    #[error("task interrupted at breakpoint {id}")]
    #[diagnostic(code(taskloom::task::breakpoint))]
    Breakpoint { id: String },

    /// The attempt exceeded its timeout budget.
    #[error("task timeout exceeded ({timeout_ms}ms)")]
    #[diagnostic(code(taskloom::task::timeout))]
    Timeout { timeout_ms: u64 },

    /// The cancellation signal fired mid-task.
    #[error("task cancelled")]
    #[diagnostic(code(taskloom::task::cancelled))]
    Cancelled,

    /// A snapshot write failed. Raised by [`TaskParams::interrupt`] when
    /// the breakpoint could not be made durable.
    #[error(transparent)]
    #[diagnostic(code(taskloom::task::persistence))]
    Persistence(#[from] PersistenceError),

    /// Any other execution failure.
    #[error("{0}")]
    #[diagnostic(code(taskloom::task::failed))]
    Failed(String),

    #[error(transparent)]
    #[diagnostic(code(taskloom::task::llm))]
    Llm(#[from] LlmError),

    #[error(transparent)]
    #[diagnostic(code(taskloom::task::tool))]
    Tool(#[from] ToolError),

    #[error(transparent)]
    #[diagnostic(code(taskloom::task::context))]
    Context(#[from] ContextError),

    #[error(transparent)]
    #[diagnostic(code(taskloom::task::serde))]
    Serde(#[from] serde_json::Error),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

/// Decision returned by an `on_error` handler.
#[derive(Clone, Debug, Default)]
pub struct ErrorDecision {
    /// Continue the attempt loop while attempts remain.
    pub retry: bool,
    /// Convert the failure into this result, flowing through the normal
    /// successor path.
    pub result: Option<Value>,
    /// Successor override used together with `result`.
    pub next: Option<Route>,
}

impl ErrorDecision {
    pub fn retry() -> Self {
        Self {
            retry: true,
            ..Self::default()
        }
    }

    pub fn recover(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_next(mut self, next: Route) -> Self {
        self.next = Some(next);
        self
    }
}

/// Synchronous router: given the task result and the shared context, pick
/// the successors. `None` is terminal.
pub type Router = Arc<dyn Fn(&Value, &TypedContext) -> Option<Route> + Send + Sync>;

/// Error handler consulted after a failed attempt.
pub type ErrorHandler = Arc<dyn Fn(&TaskError) -> ErrorDecision + Send + Sync>;

/// A named unit of async work with routing.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError>;
}

/// Adapter turning an async closure into a [`Task`].
pub struct FnTask<F>(F);

#[async_trait]
impl<F> Task for FnTask<F>
where
    F: Fn(TaskParams) -> BoxFuture<'static, Result<TaskOutput, TaskError>> + Send + Sync,
{
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        (self.0)(params).await
    }
}

/// Registration record for one task. Immutable once registered; registering
/// the same name again replaces the earlier spec.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub handler: Arc<dyn Task>,
    pub router: Option<Router>,
    pub dependencies: Vec<String>,
    pub retry_count: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub on_error: Option<ErrorHandler>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, handler: impl Task + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            router: None,
            dependencies: Vec::new(),
            retry_count: None,
            timeout_ms: None,
            on_error: None,
        }
    }

    /// Register an async closure as the task body.
    ///
    /// ```
    /// use futures_util::FutureExt;
    /// use taskloom::engine::{TaskOutput, TaskSpec};
    /// use serde_json::json;
    ///
    /// let spec = TaskSpec::from_fn("greet", |_params| {
    ///     async move { Ok(TaskOutput::value(json!("hello"))) }.boxed()
    /// });
    /// ```
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskParams) -> BoxFuture<'static, Result<TaskOutput, TaskError>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, FnTask(f))
    }

    #[must_use]
    pub fn with_router(
        mut self,
        router: impl Fn(&Value, &TypedContext) -> Option<Route> + Send + Sync + 'static,
    ) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&TaskError) -> ErrorDecision + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("retry_count", &self.retry_count)
            .field("timeout_ms", &self.timeout_ms)
            .field("has_router", &self.router.is_some())
            .field("has_on_error", &self.on_error.is_some())
            .finish()
    }
}

static BREAKPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_breakpoint_id() -> String {
    let seq = BREAKPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("bp-{}-{seq}", Utc::now().timestamp_millis())
}

/// Parameter bundle passed to every task invocation.
#[derive(Clone)]
pub struct TaskParams {
    /// Input from the predecessor (or the workflow's initial data).
    pub data: Value,
    /// Handle to the workflow's mutable state.
    pub execution: ExecutionContext,
    /// Typed event bus.
    pub events: EventBus,
    /// Typed shared context.
    pub context: TypedContext,
    /// Workflow configuration.
    pub config: WorkflowConfig,
    /// Cancellation token propagated to all IO.
    pub cancel: CancellationToken,
    pub(crate) task_name: String,
    pub(crate) workflow_id: String,
    pub(crate) redirect: Arc<Mutex<Option<Route>>>,
    pub(crate) persistence: Option<Arc<dyn PersistenceLayer>>,
}

impl TaskParams {
    /// Imperatively set the successor list, overriding both the return-value
    /// route and the router.
    pub fn redirect_to(&self, route: impl Into<Route>) {
        *self.redirect.lock() = Some(route.into());
    }

    /// Stop the workflow. A graceful abort lets in-flight tasks finish;
    /// a hard abort additionally fires the cancellation signal.
    pub fn abort(&self, graceful: bool) {
        self.execution.abort_workflow(graceful);
        if !graceful {
            self.cancel.cancel();
        }
    }

    /// Pause execution: mark this task complete with `data`, record a
    /// breakpoint, persist the snapshot, and hand back the sentinel error
    /// to return so the attempt loop unwinds cleanly.
    ///
    /// The breakpoint sentinel is only returned once the snapshot is
    /// durable. If the save fails, the breakpoint marker is cleared and the
    /// persistence error comes back instead, so the failure surfaces as a
    /// normal task failure rather than a clean pause.
    ///
    /// ```ignore
    /// return Err(params.interrupt(json!({"q": "continue?"})).await);
    /// ```
    pub async fn interrupt(&self, data: Value) -> TaskError {
        let id = next_breakpoint_id();
        self.execution.mark_task_complete(&self.task_name, data.clone());
        self.execution.set_breakpoint(BreakpointMarker {
            id: id.clone(),
            task_name: self.task_name.clone(),
            data,
        });
        if let Some(persistence) = &self.persistence {
            let snapshot = WorkflowSnapshot::capture(&self.execution, &self.events, &self.context, &self.config);
            if let Err(err) = persistence.save(&self.workflow_id, snapshot).await {
                // The pause is not durable; a later resume would find no
                // snapshot. Surface the save failure to the caller.
                self.execution.clear_breakpoint();
                tracing::error!(
                    workflow = %self.workflow_id,
                    task = %self.task_name,
                    error = %err,
                    "breakpoint snapshot was not persisted"
                );
                return TaskError::Persistence(err);
            }
        }
        TaskError::Breakpoint { id }
    }

    /// Decode the input data as `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.data.clone()).map_err(TaskError::Serde)
    }

    /// The name this task was registered under.
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// The owning workflow's persistence identity.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}
