/*!
SQLite-backed persistence layer.

Stores one row per workflow: the JSON-encoded [`WorkflowSnapshot`] plus
backend-managed timestamps. Saves are upserts; the engine persists after
every task boundary, so the row always holds the latest durable state.

Schema:

- `workflows.id` ← workflow id (primary key)
- `workflows.snapshot_json` ← serialized snapshot (camelCase wire shape)
- `workflows.last_updated` ← snapshot capture time (RFC3339)
- `workflows.created_at` / `workflows.updated_at` ← row lifecycle
*/

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::engine::persistence::{PersistenceError, PersistenceLayer, Result, WorkflowSnapshot};

/// Resolve the database name for the default store: `TASKLOOM_DB_NAME`
/// from the environment (a `.env` file is honored), falling back to
/// `taskloom.db`.
#[must_use]
pub fn default_database_name() -> String {
    dotenvy::dotenv().ok();
    std::env::var("TASKLOOM_DB_NAME").unwrap_or_else(|_| "taskloom.db".to_string())
}

/// Durable [`PersistenceLayer`] on SQLite.
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Connect to `database_url` (e.g. `sqlite://taskloom.db`) and ensure
    /// the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(backend_error)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                snapshot_json TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&pool)
        .await
        .map_err(backend_error)?;
        Ok(Self { pool })
    }
}

fn backend_error(err: sqlx::Error) -> PersistenceError {
    PersistenceError::Backend {
        message: err.to_string(),
    }
}

#[async_trait]
impl PersistenceLayer for SqlitePersistence {
    async fn save(&self, workflow_id: &str, snapshot: WorkflowSnapshot) -> Result<()> {
        let snapshot_json = serde_json::to_string(&snapshot)?;
        sqlx::query(
            "INSERT INTO workflows (id, snapshot_json, last_updated)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                snapshot_json = excluded.snapshot_json,
                last_updated = excluded.last_updated,
                updated_at = datetime('now')",
        )
        .bind(workflow_id)
        .bind(snapshot_json)
        .bind(&snapshot.last_updated)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>> {
        let row = sqlx::query("SELECT snapshot_json FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_error)?;
        match row {
            Some(row) => {
                let snapshot_json: String = row.try_get("snapshot_json").map_err(backend_error)?;
                let snapshot: WorkflowSnapshot = serde_json::from_str(&snapshot_json)?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }
}
