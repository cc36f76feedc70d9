//! Orchestrator configuration.
//!
//! Loaded from `ductile.toml` when present; every field has a
//! conservative default so a bare state directory works out of the box.

use anyhow::{Context, Result};
use ductile_state_store::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default worker cap.
const DEFAULT_WORKERS: usize = 4;

/// Default plugin invocation timeout (seconds).
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Idle sleep between queue polls when nothing is ready (milliseconds).
const DEFAULT_IDLE_POLL_MS: u64 = 250;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// State directory: database, workspaces, lock file.
    pub state_dir: PathBuf,
    /// Directory scanned for plugin manifests.
    pub plugins_dir: PathBuf,
    /// Directory scanned for pipeline definitions.
    pub pipelines_dir: PathBuf,
    /// Worker task count.
    pub workers: usize,
    /// Attempts before a retryable job goes dead.
    pub max_attempts: u32,
    /// Default plugin timeout when the manifest doesn't set one.
    pub default_timeout_secs: u64,
    /// First retry back-off (doubles per attempt).
    pub retry_backoff_secs: u64,
    /// Back-off ceiling.
    pub retry_backoff_cap_secs: u64,
    /// Idle sleep between queue polls.
    pub idle_poll_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            state_dir: ductile_logging::ductile_home(),
            plugins_dir: PathBuf::from("plugins"),
            pipelines_dir: PathBuf::from("pipelines"),
            workers: DEFAULT_WORKERS,
            max_attempts: policy.max_attempts,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_backoff_secs: policy.backoff_base.as_secs(),
            retry_backoff_cap_secs: policy.backoff_cap.as_secs(),
            idle_poll_ms: DEFAULT_IDLE_POLL_MS,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file, or defaults when the path is absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("ductile.lock")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_secs(self.retry_backoff_secs),
            backoff_cap: Duration::from_secs(self.retry_backoff_cap_secs),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}
