//! Row models and the retry policy.

use ductile_ids::{EventContextId, EventId, JobId};
use ductile_protocol::Command;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Job lifecycle status.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed (or re-queued for retry)
    Queued,
    /// Claimed by a worker and executing
    Running,
    /// Terminal: completed successfully
    Succeeded,
    /// Terminal: failed with a non-retryable error
    Failed,
    /// Terminal: retries exhausted
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            _ => Err(format!("Invalid job status: '{}'", s)),
        }
    }
}

/// A row of the job queue.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub plugin: String,
    pub command: String,
    pub status: JobStatus,
    pub attempt: i64,
    pub parent_job_id: Option<String>,
    pub source_event_id: Option<String>,
    pub event_context_id: Option<String>,
    pub submitted_by: String,
    pub payload_json: Option<String>,
    pub last_error: Option<String>,
    pub available_at: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl JobRecord {
    /// The command verb, parsed. Rows are only ever written from
    /// [`Command::as_str`], so a parse failure means operator surgery.
    pub fn parsed_command(&self) -> Result<Command, String> {
        self.command.parse()
    }

    /// The carried event payload, if any.
    pub fn payload(&self) -> Option<Value> {
        self.payload_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Everything needed to insert a `queued` row.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub plugin: String,
    pub command: Command,
    pub parent_job_id: Option<JobId>,
    pub source_event_id: Option<EventId>,
    pub event_context_id: Option<EventContextId>,
    pub submitted_by: String,
    pub payload: Option<Value>,
}

impl EnqueueRequest {
    pub fn new(plugin: impl Into<String>, command: Command) -> Self {
        Self {
            plugin: plugin.into(),
            command,
            parent_job_id: None,
            source_event_id: None,
            event_context_id: None,
            submitted_by: String::new(),
            payload: None,
        }
    }
}

/// An immutable row of the event-context ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventContext {
    pub id: EventContextId,
    pub parent_id: Option<EventContextId>,
    pub pipeline_name: String,
    pub step_id: String,
    pub accumulated: Map<String, Value>,
    pub created_at: String,
}

/// Retry schedule for failed jobs.
///
/// `backoff_for(n)` is the delay stamped into `available_at` after the
/// n-th (0-based) attempt fails retryably: base * 2^n, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(15),
            backoff_cap: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_secs(15));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(30));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(60));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(15 * 60));
        assert_eq!(policy.backoff_for(63), Duration::from_secs(15 * 60));
    }

    #[test]
    fn status_round_trips() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Dead,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }
}
