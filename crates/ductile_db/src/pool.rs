//! Pool construction and timestamp conventions.

use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// How long a statement waits on a locked database before SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Small pool: one writer at a time anyway, a few readers for inspect.
const MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to create schema: {0}")]
    Schema(#[source] sqlx::Error),
}

/// Open (creating if missing) the control-plane database.
///
/// PRAGMAs applied on every connection: `foreign_keys=ON`,
/// `journal_mode=WAL`, `synchronous=NORMAL`, `busy_timeout=5000`.
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|source| DbError::Open {
            path: db_path.display().to_string(),
            source,
        })?;

    debug!("Opened control-plane database: {}", db_path.display());
    Ok(pool)
}

/// Current time as RFC3339 with nanosecond precision in UTC.
///
/// Every timestamp column in the schema stores exactly this format, so
/// lexicographic ordering matches chronological ordering.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}
