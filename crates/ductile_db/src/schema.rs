//! Idempotent schema creation.

use crate::pool::DbError;
use sqlx::SqlitePool;

/// Create the control-plane tables if they don't exist.
///
/// Safe to run on every startup. The partial unique index on
/// `(parent_job_id, source_event_id)` is what makes child enqueue
/// idempotent across parent retries.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_context (
            id TEXT PRIMARY KEY,
            parent_id TEXT REFERENCES event_context(id),
            pipeline_name TEXT NOT NULL,
            step_id TEXT NOT NULL,
            accumulated_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::Schema)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_queue (
            id TEXT PRIMARY KEY,
            plugin TEXT NOT NULL,
            command TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            attempt INTEGER NOT NULL DEFAULT 0,
            parent_job_id TEXT,
            source_event_id TEXT,
            event_context_id TEXT REFERENCES event_context(id),
            submitted_by TEXT NOT NULL DEFAULT '',
            payload_json TEXT,
            last_error TEXT,
            available_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::Schema)?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_job_queue_claim
        ON job_queue(status, available_at, created_at ASC)
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::Schema)?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_job_queue_child_identity
        ON job_queue(parent_job_id, source_event_id)
        WHERE parent_job_id IS NOT NULL AND source_event_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::Schema)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plugin_state (
            plugin_name TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::Schema)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_pool;

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("state.db")).await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(names.contains(&"job_queue"));
        assert!(names.contains(&"event_context"));
        assert!(names.contains(&"plugin_state"));
    }

    #[tokio::test]
    async fn pragmas_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("state.db")).await.unwrap();

        let (journal_mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let (fk,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }
}
