//! Shared logging utilities for Ductile binaries.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "ductile=info,ductile_sentinel=info,ductile_runner=info";

/// Logging configuration shared by Ductile binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a log file and stderr output.
///
/// The file layer always records at the env-filter level; the stderr
/// layer is quiet (warn) unless `verbose` is set, so the CLI stays
/// readable while the file keeps the full story.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let log_path = log_dir.join(format!("{}.log", config.app_name));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Resolve the Ductile home directory.
///
/// Priority:
/// 1) DUCTILE_HOME
/// 2) HOME/.ductile
/// 3) ./.ductile
pub fn ductile_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("DUCTILE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(".ductile"))
        .unwrap_or_else(|| PathBuf::from(".").join(".ductile"))
}

/// State database path: `<home>/state.db`
pub fn default_state_db_path() -> PathBuf {
    ductile_home().join("state.db")
}

/// Workspace tree: `<home>/workspaces`
pub fn default_workspaces_dir() -> PathBuf {
    ductile_home().join("workspaces")
}

/// Single-instance lock: `<home>/ductile.lock`
pub fn default_lock_path() -> PathBuf {
    ductile_home().join("ductile.lock")
}

/// Logs directory: `<home>/logs`
pub fn logs_dir() -> PathBuf {
    ductile_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}
