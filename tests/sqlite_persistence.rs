#![cfg(feature = "sqlite")]

use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::json;
use taskloom::engine::{
    PersistenceLayer, SqlitePersistence, TaskOutput, TaskSpec, WorkflowEngine,
};

fn temp_database_url(tag: &str) -> (std::path::PathBuf, String) {
    let path = std::env::temp_dir().join(format!("taskloom-{tag}-{}.db", std::process::id()));
    let url = format!("sqlite://{}?mode=rwc", path.display());
    (path, url)
}

#[tokio::test]
async fn save_and_load_roundtrip() {
    let (path, url) = temp_database_url("roundtrip");
    let store = Arc::new(SqlitePersistence::connect(&url).await.unwrap());

    let mut engine = WorkflowEngine::new("wf-sqlite").with_persistence(store.clone());
    engine.task(TaskSpec::from_fn("only", |params| {
        async move {
            params.context.set_raw("k", json!("v"));
            Ok(TaskOutput::value(json!("done")))
        }
        .boxed()
    }));
    engine.start("only", json!(null)).await.unwrap();

    let snapshot = store.load("wf-sqlite").await.unwrap().unwrap();
    assert_eq!(snapshot.context_state.get("k"), Some(&json!("v")));
    assert_eq!(snapshot.execution_counts.get("only"), Some(&1));

    // Upsert keeps a single row per workflow.
    store.save("wf-sqlite", snapshot.clone()).await.unwrap();
    let again = store.load("wf-sqlite").await.unwrap().unwrap();
    assert_eq!(again, snapshot);

    assert!(store.load("wf-absent").await.unwrap().is_none());
    let _ = std::fs::remove_file(path);
}
