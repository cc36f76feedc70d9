//! Durable FIFO job queue with atomic claim and idempotent child enqueue.

use crate::error::{StoreError, StoreResult};
use crate::models::{EnqueueRequest, JobRecord, JobStatus, RetryPolicy};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use ductile_db::now_rfc3339;
use ductile_ids::JobId;
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Capability interface over the queue.
///
/// The dispatcher and worker pool only ever see this trait, so tests can
/// substitute doubles for the SQLite implementation.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, req: EnqueueRequest) -> StoreResult<JobId>;
    async fn dequeue(&self) -> StoreResult<Option<JobRecord>>;
    async fn get(&self, job_id: &str) -> StoreResult<JobRecord>;
    async fn complete(&self, job_id: &str) -> StoreResult<()>;
    async fn fail(&self, job_id: &str, error: &str, retryable: bool) -> StoreResult<JobStatus>;
    async fn children_of(&self, parent_job_id: &str) -> StoreResult<Vec<JobRecord>>;
}

pub struct JobQueue {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl QueueStore for JobQueue {
    /// Insert a `queued` row and return its id.
    ///
    /// When both `parent_job_id` and `source_event_id` are present the
    /// insert is idempotent: a conflict on the child-identity index means
    /// a previous execution of the same parent already enqueued this
    /// child, and the existing row's id is returned instead. This is what
    /// makes parent retry safe.
    async fn enqueue(&self, req: EnqueueRequest) -> StoreResult<JobId> {
        if req.plugin.trim().is_empty() {
            return Err(StoreError::EmptyPluginName);
        }

        let id = JobId::new();
        let now = now_rfc3339();
        let payload_json = req
            .payload
            .as_ref()
            .map(|p| serde_json::to_string(p))
            .transpose()
            .map_err(|_| StoreError::CorruptJson {
                what: "payload",
                owner: req.plugin.clone(),
            })?;

        let is_child = req.parent_job_id.is_some() && req.source_event_id.is_some();
        let conflict_clause = if is_child {
            "ON CONFLICT (parent_job_id, source_event_id) DO NOTHING"
        } else {
            ""
        };

        let sql = format!(
            r#"
            INSERT INTO job_queue
                (id, plugin, command, status, attempt, parent_job_id, source_event_id,
                 event_context_id, submitted_by, payload_json, available_at, created_at)
            VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            {conflict_clause}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(&req.plugin)
            .bind(req.command.as_str())
            .bind(req.parent_job_id.as_ref().map(|v| v.as_str()))
            .bind(req.source_event_id.as_ref().map(|v| v.as_str()))
            .bind(req.event_context_id.as_ref().map(|v| v.as_str()))
            .bind(&req.submitted_by)
            .bind(payload_json.as_deref())
            .bind(&now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            // Duplicate child: hand back the row the earlier execution made.
            let (existing,): (String,) = sqlx::query_as(
                r#"
                SELECT id FROM job_queue
                WHERE parent_job_id = ?1 AND source_event_id = ?2
                "#,
            )
            .bind(req.parent_job_id.as_ref().map(|v| v.as_str()))
            .bind(req.source_event_id.as_ref().map(|v| v.as_str()))
            .fetch_one(&self.pool)
            .await?;
            debug!(
                "Child enqueue deduplicated: plugin={} existing_job={}",
                req.plugin, existing
            );
            return Ok(JobId::from_string(existing));
        }

        info!("Enqueued job {} ({} {})", id, req.plugin, req.command);
        Ok(id)
    }

    /// Claim the oldest ready job, transitioning it to `running`.
    ///
    /// The claim is a single UPDATE ... RETURNING statement, so two
    /// workers can never pop the same row. Ordering: `created_at`
    /// non-decreasing, ties by insertion (rowid) order. Rows whose
    /// `available_at` lies in the future (retry back-off) are skipped.
    async fn dequeue(&self) -> StoreResult<Option<JobRecord>> {
        let now = now_rfc3339();
        let job: Option<JobRecord> = sqlx::query_as(
            r#"
            UPDATE job_queue
            SET status = 'running', started_at = ?1
            WHERE id = (
                SELECT id FROM job_queue
                WHERE status = 'queued' AND available_at <= ?1
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            debug!("Claimed job {} ({} {})", job.id, job.plugin, job.command);
        }
        Ok(job)
    }

    /// Fetch a job row by id.
    async fn get(&self, job_id: &str) -> StoreResult<JobRecord> {
        sqlx::query_as("SELECT * FROM job_queue WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    /// Mark a job `succeeded`.
    async fn complete(&self, job_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'succeeded', finished_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(now_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        info!("Job {} succeeded", job_id);
        Ok(())
    }

    /// Record a failure and decide the job's fate.
    ///
    /// Retryable with attempts left: back to `queued`, attempt bumped,
    /// `available_at` pushed out by the retry policy. Retryable but
    /// exhausted: `dead`. Non-retryable: `failed`.
    async fn fail(&self, job_id: &str, error: &str, retryable: bool) -> StoreResult<JobStatus> {
        let mut tx = self.pool.begin().await?;

        let attempt: Option<(i64,)> =
            sqlx::query_as("SELECT attempt FROM job_queue WHERE id = ?1")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((attempt,)) = attempt else {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        };
        let attempt = attempt as u32;

        let next_status = if !retryable {
            JobStatus::Failed
        } else if attempt + 1 < self.retry.max_attempts {
            JobStatus::Queued
        } else {
            JobStatus::Dead
        };

        match next_status {
            JobStatus::Queued => {
                let delay = self.retry.backoff_for(attempt);
                let available_at = (Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()))
                .to_rfc3339_opts(SecondsFormat::Nanos, true);
                sqlx::query(
                    r#"
                    UPDATE job_queue
                    SET status = 'queued', attempt = attempt + 1,
                        last_error = ?1, available_at = ?2
                    WHERE id = ?3
                    "#,
                )
                .bind(error)
                .bind(&available_at)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
                info!(
                    "Job {} failed (attempt {}), retrying in {:?}: {}",
                    job_id, attempt, delay, error
                );
            }
            terminal => {
                sqlx::query(
                    r#"
                    UPDATE job_queue
                    SET status = ?1, last_error = ?2, finished_at = ?3
                    WHERE id = ?4
                    "#,
                )
                .bind(terminal)
                .bind(error)
                .bind(now_rfc3339())
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
                info!("Job {} {}: {}", job_id, terminal, error);
            }
        }

        tx.commit().await?;
        Ok(next_status)
    }

    /// Children of a job, in creation order. Used by inspect and tests.
    async fn children_of(&self, parent_job_id: &str) -> StoreResult<Vec<JobRecord>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM job_queue
            WHERE parent_job_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(parent_job_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
