//! Ductile launcher.
//!
//! One binary, four entry points: `run` starts the worker loop under
//! the single-instance lock; `enqueue`, `inspect`, and `cleanup` are
//! operator utilities against the same state directory.
//!
//! Exit codes: 0 success, 1 startup/command error, 2 lock contention.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ductile_db::{InstanceLock, LockError};
use ductile_runner::CancellationToken;
use ductile_sentinel::{OrchestratorConfig, Sentinel};
use ductile_state_store::{EnqueueRequest, JobQueue, QueueStore};
use ductile_workspace::{FsWorkspaces, WorkspaceStore};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

mod inspect;

const EXIT_OK: u8 = 0;
const EXIT_STARTUP: u8 = 1;
const EXIT_LOCKED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ductile", about = "Local pipeline orchestrator")]
struct Cli {
    /// Enable verbose logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Path to a ductile.toml config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator worker loop
    Run,

    /// Enqueue a job for a plugin
    Enqueue {
        /// Plugin name
        plugin: String,
        /// Command verb: poll, handle, health, or init
        command: String,
        /// Optional event JSON to carry in the job payload
        #[arg(long)]
        event_json: Option<String>,
    },

    /// Show a job with its context lineage
    Inspect {
        job_id: String,
        /// Emit the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Remove workspaces older than the given age (e.g. 24h, 90m, 3600s)
    Cleanup {
        #[arg(long)]
        older_than: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = ductile_logging::init_logging(ductile_logging::LogConfig {
        app_name: "ductile",
        verbose: cli.verbose,
    }) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::from(EXIT_STARTUP);
    }

    let config = match OrchestratorConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let result = match cli.command {
        Commands::Run => return run(config).await,
        Commands::Enqueue {
            plugin,
            command,
            event_json,
        } => enqueue(config, plugin, command, event_json).await,
        Commands::Inspect { job_id, json } => inspect::report(config, &job_id, json).await,
        Commands::Cleanup { older_than } => cleanup(config, &older_than),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

/// Acquire the instance lock and drain the queue until SIGINT/SIGTERM.
async fn run(config: OrchestratorConfig) -> ExitCode {
    if let Err(e) = std::fs::create_dir_all(&config.state_dir) {
        error!(
            "Failed to create state directory {}: {}",
            config.state_dir.display(),
            e
        );
        return ExitCode::from(EXIT_STARTUP);
    }

    let _lock = match InstanceLock::acquire(&config.lock_path()) {
        Ok(lock) => lock,
        Err(e @ LockError::Held { .. }) => {
            error!("{e}");
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_LOCKED);
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let sentinel = match Sentinel::start(config).await {
        Ok(sentinel) => sentinel,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    sentinel.run(cancel).await;
    info!("Shutdown complete");
    ExitCode::from(EXIT_OK)
}

/// Watch for SIGINT/SIGTERM on a plain thread and flip the token.
fn spawn_signal_listener(cancel: CancellationToken) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    std::thread::spawn(move || {
        let mut signals = match Signals::new([SIGINT, SIGTERM]) {
            Ok(signals) => signals,
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                return;
            }
        };
        if let Some(signal) = signals.forever().next() {
            info!("Received signal {}, shutting down", signal);
            cancel.cancel();
        }
    });
}

async fn enqueue(
    config: OrchestratorConfig,
    plugin: String,
    command: String,
    event_json: Option<String>,
) -> Result<()> {
    let command = command
        .parse::<ductile_protocol::Command>()
        .map_err(anyhow::Error::msg)?;
    let payload = event_json
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--event-json is not valid JSON")?;

    let queue = open_queue(&config).await?;
    let mut req = EnqueueRequest::new(plugin, command);
    req.submitted_by = "cli".to_string();
    req.payload = payload;
    let id = queue.enqueue(req).await?;
    println!("{id}");
    Ok(())
}

fn cleanup(config: OrchestratorConfig, older_than: &str) -> Result<()> {
    let age = parse_duration(older_than)?;
    let workspaces = FsWorkspaces::new(config.workspaces_dir());
    let report = workspaces.cleanup(age)?;
    println!("Deleted {} workspace dir(s)", report.deleted_dirs.len());
    for dir in report.deleted_dirs {
        println!("  {}", dir.display());
    }
    Ok(())
}

async fn open_queue(config: &OrchestratorConfig) -> Result<JobQueue> {
    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!("Failed to create state directory: {}", config.state_dir.display())
    })?;
    let db = ductile_db::open_pool(&config.state_db_path()).await?;
    ductile_db::init_schema(&db).await?;
    Ok(JobQueue::new(db, config.retry_policy()))
}

/// Parse `90s` / `30m` / `24h` style durations.
fn parse_duration(raw: &str) -> Result<std::time::Duration> {
    let raw = raw.trim();
    let multiplier = match raw.chars().last() {
        Some('s') => 1,
        Some('m') => 60,
        Some('h') => 3600,
        Some('d') => 86_400,
        _ => anyhow::bail!("invalid duration {raw:?}: expected <n>s, <n>m, <n>h, or <n>d"),
    };
    let value: u64 = raw[..raw.len() - 1]
        .parse()
        .with_context(|| format!("invalid duration {raw:?}"))?;
    Ok(std::time::Duration::from_secs(value * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("90s").unwrap().as_secs(), 90);
        assert_eq!(parse_duration("30m").unwrap().as_secs(), 1800);
        assert_eq!(parse_duration("24h").unwrap().as_secs(), 86_400);
        assert_eq!(parse_duration("2d").unwrap().as_secs(), 172_800);
        assert!(parse_duration("nope").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
    }
}
