use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::json;
use taskloom::engine::{
    EngineError, InMemoryPersistence, PersistenceError, PersistenceLayer, Route, TaskOutput,
    TaskSpec, WorkflowEngine, WorkflowSnapshot,
};

/// Build the breakpoint workflow: `H` interrupts on its first pass and
/// proceeds to `finish` when re-invoked with the breakpoint data.
fn build_engine(
    persistence: Arc<InMemoryPersistence>,
    finish_ran: Arc<AtomicBool>,
) -> WorkflowEngine {
    let mut engine = WorkflowEngine::new("wf-bp").with_persistence(persistence);
    engine.task(TaskSpec::from_fn("H", |params| {
        async move {
            if params.data.get("q").is_some() {
                Ok(TaskOutput::routed(
                    params.data.clone(),
                    Route::Next("finish".into()),
                ))
            } else {
                Err(params.interrupt(json!({"q": "continue?"})).await)
            }
        }
        .boxed()
    }));
    engine.task(TaskSpec::from_fn("finish", move |_params| {
        let finish_ran = finish_ran.clone();
        async move {
            finish_ran.store(true, Ordering::SeqCst);
            Ok(TaskOutput::value(json!("done")))
        }
        .boxed()
    }));
    engine
}

#[tokio::test]
async fn breakpoint_persists_before_unwinding() {
    let store = Arc::new(InMemoryPersistence::new());
    let finish_ran = Arc::new(AtomicBool::new(false));
    let engine = build_engine(store.clone(), finish_ran.clone());
    engine.context().set_raw("note", json!("kept"));

    let result = engine.start("H", json!(null)).await.unwrap();
    assert_eq!(result, json!({"q": "continue?"}));
    assert!(!finish_ran.load(Ordering::SeqCst));

    let snapshot = store.load("wf-bp").await.unwrap().unwrap();
    // The breakpoint is durable, with the legacy collection envelopes.
    assert_eq!(
        snapshot.workflow_state["breakpoint"]["taskName"],
        json!("H")
    );
    assert_eq!(
        snapshot.workflow_state["breakpoint"]["data"],
        json!({"q": "continue?"})
    );
    assert_eq!(snapshot.workflow_state["completedTasks"]["type"], json!("Set"));
    assert_eq!(snapshot.workflow_state["taskData"]["type"], json!("Map"));
    assert_eq!(snapshot.context_state.get("note"), Some(&json!("kept")));
    assert_eq!(snapshot.execution_counts.get("H"), Some(&1));
}

#[tokio::test]
async fn resume_restores_state_and_continues() {
    let store = Arc::new(InMemoryPersistence::new());
    let first_flag = Arc::new(AtomicBool::new(false));
    let engine = build_engine(store.clone(), first_flag);
    engine.context().set_raw("note", json!("kept"));
    engine.start("H", json!(null)).await.unwrap();

    let breakpoint = store
        .load("wf-bp")
        .await
        .unwrap()
        .unwrap()
        .decode_execution()
        .unwrap()
        .breakpoint
        .unwrap();

    // Fresh engine, as after a process restart.
    let finish_ran = Arc::new(AtomicBool::new(false));
    let engine = build_engine(store.clone(), finish_ran.clone());
    let result = engine.resume("wf-bp", &breakpoint.id).await.unwrap();

    assert_eq!(result, json!({"q": "continue?"}));
    assert!(finish_ran.load(Ordering::SeqCst));
    // Context and counts came back from the snapshot before re-execution.
    assert_eq!(engine.context().get_raw("note"), Some(json!("kept")));
    assert_eq!(engine.execution().get_task_execution_count("H"), 2);
    assert_eq!(engine.execution().get_task_execution_count("finish"), 1);
    assert!(engine.execution().breakpoint().is_none());
}

#[tokio::test]
async fn resume_rejects_unknown_breakpoint_id() {
    let store = Arc::new(InMemoryPersistence::new());
    let engine = build_engine(store.clone(), Arc::new(AtomicBool::new(false)));
    engine.start("H", json!(null)).await.unwrap();

    let err = engine.resume("wf-bp", "bp-bogus").await.unwrap_err();
    assert!(matches!(err, EngineError::BreakpointMismatch { .. }));
}

#[tokio::test]
async fn resume_fails_when_breakpoint_task_is_unregistered() {
    let store = Arc::new(InMemoryPersistence::new());
    let engine = build_engine(store.clone(), Arc::new(AtomicBool::new(false)));
    engine.start("H", json!(null)).await.unwrap();
    let breakpoint = store
        .load("wf-bp")
        .await
        .unwrap()
        .unwrap()
        .decode_execution()
        .unwrap()
        .breakpoint
        .unwrap();

    // An engine missing the breakpoint task cannot resume into it.
    let mut stripped = WorkflowEngine::new("wf-bp").with_persistence(store.clone());
    stripped.task(TaskSpec::from_fn("finish", |_params| {
        async move { Ok(TaskOutput::value(json!("done"))) }.boxed()
    }));
    let err = stripped.resume("wf-bp", &breakpoint.id).await.unwrap_err();
    assert!(matches!(err, EngineError::TaskNotFound { .. }));
}

/// Store whose saves always fail, as with a full disk or lock contention.
struct FailingStore;

#[async_trait]
impl PersistenceLayer for FailingStore {
    async fn save(&self, _workflow_id: &str, _snapshot: WorkflowSnapshot) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend {
            message: "disk full".to_string(),
        })
    }

    async fn load(&self, _workflow_id: &str) -> Result<Option<WorkflowSnapshot>, PersistenceError> {
        Ok(None)
    }
}

#[tokio::test]
async fn failed_breakpoint_persist_surfaces_as_task_failure() {
    let mut engine = WorkflowEngine::new("wf-bp-fail").with_persistence(Arc::new(FailingStore));
    engine.task(TaskSpec::from_fn("H", |params| {
        async move { Err(params.interrupt(json!({"q": "continue?"})).await) }.boxed()
    }));

    // The save failure must not masquerade as a clean pause.
    let err = engine.start("H", json!(null)).await.unwrap_err();
    assert!(matches!(err, EngineError::Task { .. }));
    assert!(err.to_string().contains("disk full"));
    assert!(engine.execution().breakpoint().is_none());
}

#[tokio::test]
async fn resume_without_persistence_is_rejected() {
    let engine = WorkflowEngine::new("wf-none");
    let err = engine.resume("wf-none", "bp-1").await.unwrap_err();
    assert!(matches!(err, EngineError::PersistenceUnavailable));
}

#[tokio::test]
async fn resume_without_snapshot_is_rejected() {
    let store = Arc::new(InMemoryPersistence::new());
    let engine = build_engine(store, Arc::new(AtomicBool::new(false)));
    let err = engine.resume("wf-unknown", "bp-1").await.unwrap_err();
    assert!(matches!(err, EngineError::SnapshotNotFound { .. }));
}
