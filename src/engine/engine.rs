use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::context::TypedContext;
use crate::engine::config::WorkflowConfig;
use crate::engine::persistence::{PersistenceError, PersistenceLayer, WorkflowSnapshot};
use crate::engine::task::{Route, TaskError, TaskParams, TaskSpec};
use crate::event_bus::{channels, EventBus, StatusPayload, WorkflowStatus};
use crate::execution::ExecutionContext;
use crate::llm::LlmError;

/// Errors escaping the engine.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("task not found: {name}")]
    #[diagnostic(
        code(taskloom::engine::task_not_found),
        help("Register the task before starting the workflow or resuming into it.")
    )]
    TaskNotFound { name: String },

    #[error("task '{name}' failed: {source}")]
    #[diagnostic(code(taskloom::engine::task_failed))]
    Task {
        name: String,
        #[source]
        source: TaskError,
    },

    #[error(transparent)]
    #[diagnostic(code(taskloom::engine::persistence))]
    Persistence(#[from] PersistenceError),

    #[error("no persistence layer configured")]
    #[diagnostic(
        code(taskloom::engine::persistence_unavailable),
        help("Attach a PersistenceLayer with with_persistence() before resuming.")
    )]
    PersistenceUnavailable,

    #[error("no snapshot stored for workflow '{workflow_id}'")]
    #[diagnostic(code(taskloom::engine::snapshot_not_found))]
    SnapshotNotFound { workflow_id: String },

    #[error("no breakpoint recorded for workflow '{workflow_id}'")]
    #[diagnostic(code(taskloom::engine::breakpoint_not_found))]
    BreakpointNotFound { workflow_id: String },

    #[error("breakpoint mismatch: requested '{requested}', stored '{stored}'")]
    #[diagnostic(code(taskloom::engine::breakpoint_mismatch))]
    BreakpointMismatch { requested: String, stored: String },
}

/// Task scheduler for one workflow: registry, dependency gating, retry
/// loop, timeout race, routing resolution, breakpoints and abort.
///
/// # Examples
///
/// ```
/// use futures_util::FutureExt;
/// use serde_json::json;
/// use taskloom::engine::{TaskOutput, TaskSpec, WorkflowEngine};
///
/// # async fn example() -> Result<(), taskloom::engine::EngineError> {
/// let mut engine = WorkflowEngine::new("wf-docs");
/// engine.task(TaskSpec::from_fn("greet", |_params| {
///     async move { Ok(TaskOutput::value(json!("hello"))) }.boxed()
/// }));
/// let result = engine.start("greet", json!({})).await?;
/// assert_eq!(result, json!("hello"));
/// # Ok(())
/// # }
/// ```
pub struct WorkflowEngine {
    workflow_id: String,
    tasks: FxHashMap<String, Arc<TaskSpec>>,
    context: TypedContext,
    events: EventBus,
    execution: ExecutionContext,
    config: WorkflowConfig,
    persistence: Option<Arc<dyn PersistenceLayer>>,
}

impl WorkflowEngine {
    /// Create an engine with default configuration and a fresh event bus.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self::with_config(workflow_id, WorkflowConfig::default())
    }

    #[must_use]
    pub fn with_config(workflow_id: impl Into<String>, config: WorkflowConfig) -> Self {
        let events = EventBus::new();
        let execution = ExecutionContext::new(events.clone());
        Self {
            workflow_id: workflow_id.into(),
            tasks: FxHashMap::default(),
            context: TypedContext::new(),
            events,
            execution,
            config,
            persistence: None,
        }
    }

    /// Replace the event bus (e.g. one carrying per-request sinks). Resets
    /// the execution context, so call this before registering work.
    #[must_use]
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.execution = ExecutionContext::new(events.clone());
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceLayer>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Register a task. Registering the same name again replaces the
    /// earlier spec.
    pub fn task(&mut self, spec: TaskSpec) -> &mut Self {
        self.tasks.insert(spec.name.clone(), Arc::new(spec));
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn context(&self) -> &TypedContext {
        &self.context
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.execution
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Start the workflow at `initial_task`. Object-shaped initial data is
    /// merged into the shared context; the value is also handed to the task
    /// as its input. Emits the terminal `status` event when the run settles.
    #[instrument(skip(self, initial_data), fields(workflow = %self.workflow_id), err)]
    pub async fn start(&self, initial_task: &str, initial_data: Value) -> Result<Value, EngineError> {
        self.context.merge_object(&initial_data);
        let _ = self
            .events
            .emit(&channels::STATUS, &StatusPayload::new(WorkflowStatus::Pending));

        match self.execute_task(initial_task, initial_data).await {
            Ok(result) => {
                let status = if self.execution.is_aborted() {
                    WorkflowStatus::Aborted
                } else if self.execution.breakpoint().is_some() {
                    // Paused, not finished; the terminal status comes after
                    // resume.
                    WorkflowStatus::Pending
                } else {
                    WorkflowStatus::Completed
                };
                let _ = self.events.emit(&channels::STATUS, &StatusPayload::new(status));
                tracing::info!(summary = %self.execution.main_timing_summary(), "workflow finished");
                Ok(result)
            }
            Err(err) => {
                let _ = self.events.emit(
                    &channels::STATUS,
                    &StatusPayload::with_message(WorkflowStatus::Error, err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Stop the workflow. Graceful lets in-flight tasks finish and
    /// suppresses successor dispatch; hard additionally fires the
    /// cancellation signal so in-flight IO fails fast.
    #[instrument(skip(self), fields(workflow = %self.workflow_id))]
    pub async fn abort(&self, graceful: bool) {
        self.execution.abort_workflow(graceful);
        if !graceful {
            self.config.cancel.cancel();
        }
        if let Err(err) = self.persist().await {
            tracing::warn!(error = %err, "failed to persist abort state");
        }
    }

    /// Resume a workflow from its persisted breakpoint: restore execution
    /// state, event state, context and counts, then re-invoke the
    /// breakpoint task with its recorded data.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, workflow_id: &str, breakpoint_id: &str) -> Result<Value, EngineError> {
        let persistence = self
            .persistence
            .as_ref()
            .ok_or(EngineError::PersistenceUnavailable)?;
        let snapshot = persistence
            .load(workflow_id)
            .await?
            .ok_or_else(|| EngineError::SnapshotNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        let exec = snapshot.decode_execution()?;
        let breakpoint = exec
            .breakpoint
            .clone()
            .ok_or_else(|| EngineError::BreakpointNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        if breakpoint.id != breakpoint_id {
            return Err(EngineError::BreakpointMismatch {
                requested: breakpoint_id.to_string(),
                stored: breakpoint.id,
            });
        }
        if !self.tasks.contains_key(&breakpoint.task_name) {
            return Err(EngineError::TaskNotFound {
                name: breakpoint.task_name,
            });
        }

        self.execution.restore(exec);
        self.events.set_all_state(snapshot.event_state.clone());
        self.context.restore(snapshot.context_state.clone());
        self.execution.clear_breakpoint();
        tracing::info!(
            workflow = workflow_id,
            task = %breakpoint.task_name,
            breakpoint = breakpoint_id,
            "resuming from breakpoint"
        );
        self.execute_task(&breakpoint.task_name, breakpoint.data.clone())
            .await
    }

    /// Execute one task and recursively its successors.
    ///
    /// The dependency gate returns silently rather than queuing: callers
    /// arrange task ordering, the guard is defensive.
    pub fn execute_task<'a>(
        &'a self,
        name: &'a str,
        data: Value,
    ) -> BoxFuture<'a, Result<Value, EngineError>> {
        async move {
            if self.execution.is_aborted() && !self.execution.is_graceful_shutdown() {
                tracing::debug!(task = name, "workflow aborted; task skipped");
                return Ok(Value::Null);
            }

            let Some(spec) = self.tasks.get(name).cloned() else {
                self.execution.start_task_timing(name);
                self.execution.end_task_timing(name, Some("task not found"));
                return Err(EngineError::TaskNotFound {
                    name: name.to_string(),
                });
            };

            if let Some(missing) = spec
                .dependencies
                .iter()
                .find(|dep| !self.execution.is_task_complete(dep))
            {
                tracing::debug!(task = name, dependency = %missing, "dependency incomplete; deferring");
                return Ok(Value::Null);
            }

            if self.execution.is_task_complete(name) {
                self.execution.reset_task_completion(name);
            }

            if self.execution.is_task_running(name) {
                tracing::debug!(task = name, "task already running; re-entry ignored");
                return Ok(Value::Null);
            }

            self.execution.set_task_running(name);
            let run_number = self.execution.get_task_execution_count(name) + 1;
            tracing::info!(task = name, run = run_number, "task run");

            let retry_count = spec.retry_count.unwrap_or(self.config.max_retries);
            let max_attempts = retry_count + 1;
            let mut attempt: u32 = 0;

            loop {
                attempt += 1;
                self.execution.start_task_timing(name);

                let redirect: Arc<Mutex<Option<Route>>> = Arc::new(Mutex::new(None));
                let params = TaskParams {
                    data: data.clone(),
                    execution: self.execution.clone(),
                    events: self.events.clone(),
                    context: self.context.clone(),
                    config: self.config.clone(),
                    cancel: self.config.cancel.clone(),
                    task_name: name.to_string(),
                    workflow_id: self.workflow_id.clone(),
                    redirect: redirect.clone(),
                    persistence: self.persistence.clone(),
                };

                let timeout_ms = spec.timeout_ms.or(self.config.timeout_ms);
                let attempt_result = match timeout_ms {
                    Some(ms) => {
                        match tokio::time::timeout(
                            Duration::from_millis(ms),
                            spec.handler.execute(params),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(TaskError::Timeout { timeout_ms: ms }),
                        }
                    }
                    None => spec.handler.execute(params).await,
                };

                match attempt_result {
                    Ok(output) => {
                        let (result, next_from_output) = output.into_parts();
                        self.execution.end_task_timing(name, None);
                        self.execution.mark_task_complete(name, result.clone());
                        self.persist().await?;

                        if self.execution.is_aborted() && !self.execution.is_graceful_shutdown() {
                            return Ok(result);
                        }

                        // Resolution order: imperative redirect, then the
                        // return-value route, then the router.
                        let route = redirect
                            .lock()
                            .take()
                            .or(next_from_output)
                            .or_else(|| {
                                spec.router
                                    .as_ref()
                                    .and_then(|router| router(&result, &self.context))
                            });
                        self.dispatch_successors(&result, route).await?;
                        self.persist().await?;
                        return Ok(result);
                    }
                    Err(err) => {
                        self.execution.end_task_timing(name, Some(&err.to_string()));

                        if let TaskError::Breakpoint { id } = &err {
                            self.execution.finish_task_running(name);
                            tracing::info!(task = name, breakpoint = %id, "workflow paused at breakpoint");
                            return Ok(self.execution.task_data(name).unwrap_or(Value::Null));
                        }

                        // A hard abort is the terminal state; in-flight
                        // failures racing it are swallowed.
                        if self.execution.is_aborted() && !self.execution.is_graceful_shutdown() {
                            self.execution.finish_task_running(name);
                            tracing::debug!(task = name, error = %err, "failure during hard abort; swallowed");
                            return Ok(Value::Null);
                        }

                        let retryable = !matches!(
                            err,
                            TaskError::Cancelled | TaskError::Llm(LlmError::Cancelled)
                        );

                        if let Some(handler) = &spec.on_error {
                            let decision = handler(&err);
                            if decision.retry && retryable && attempt < max_attempts {
                                tracing::warn!(task = name, attempt, error = %err, "error handler requested retry");
                                self.backoff(attempt).await;
                                continue;
                            }
                            if let Some(result) = decision.result {
                                tracing::warn!(task = name, error = %err, "error handler recovered with fallback result");
                                self.execution.mark_task_complete(name, result.clone());
                                self.persist().await?;
                                if self.execution.is_aborted()
                                    && !self.execution.is_graceful_shutdown()
                                {
                                    return Ok(result);
                                }
                                let route = decision.next.or_else(|| {
                                    spec.router
                                        .as_ref()
                                        .and_then(|router| router(&result, &self.context))
                                });
                                self.dispatch_successors(&result, route).await?;
                                self.persist().await?;
                                return Ok(result);
                            }
                            self.execution.finish_task_running(name);
                            return Err(EngineError::Task {
                                name: name.to_string(),
                                source: err,
                            });
                        }

                        if retryable && attempt < max_attempts {
                            tracing::warn!(task = name, attempt, error = %err, "task attempt failed; retrying");
                            self.backoff(attempt).await;
                            continue;
                        }

                        self.execution.finish_task_running(name);
                        return Err(EngineError::Task {
                            name: name.to_string(),
                            source: err,
                        });
                    }
                }
            }
        }
        .boxed()
    }

    /// Dispatch resolved successors. Suppressed once any abort is in
    /// effect; fan-out errors propagate after all siblings settle.
    async fn dispatch_successors(
        &self,
        result: &Value,
        route: Option<Route>,
    ) -> Result<(), EngineError> {
        let Some(route) = route else { return Ok(()) };
        if self.execution.is_aborted() {
            tracing::debug!("abort in effect; successor dispatch suppressed");
            return Ok(());
        }
        match route {
            Route::End => Ok(()),
            Route::Next(next) => {
                self.execute_task(&next, result.clone()).await?;
                Ok(())
            }
            Route::Fanout(targets) => {
                let futures = targets.into_iter().map(|target| {
                    let data = target.data.unwrap_or_else(|| result.clone());
                    let task = target.task;
                    async move { self.execute_task(&task, data).await }
                });
                let settled = join_all(futures).await;
                for outcome in settled {
                    outcome?;
                }
                Ok(())
            }
        }
    }

    async fn backoff(&self, failed_attempts: u32) {
        let delay = self.config.retry_delay(failed_attempts);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn persist(&self) -> Result<(), EngineError> {
        if let Some(persistence) = &self.persistence {
            let snapshot =
                WorkflowSnapshot::capture(&self.execution, &self.events, &self.context, &self.config);
            persistence.save(&self.workflow_id, snapshot).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflow_id", &self.workflow_id)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("has_persistence", &self.persistence.is_some())
            .finish()
    }
}
