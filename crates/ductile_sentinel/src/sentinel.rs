//! Composition root: wire the stores, registry, router, and runner into
//! a running worker pool.

use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::pool::WorkerPool;
use crate::registry::PluginRegistry;
use crate::router::Router;
use anyhow::{Context, Result};
use ductile_runner::{CancellationToken, PluginRunner};
use ductile_state_store::{ContextStore, JobQueue, PluginStateStore, QueueStore};
use ductile_workspace::{FsWorkspaces, WorkspaceStore};
use std::sync::Arc;
use tracing::info;

pub struct Sentinel {
    config: OrchestratorConfig,
    workers: WorkerPool,
}

impl Sentinel {
    /// Open the database, discover plugins and pipelines, and assemble
    /// the worker pool. Does not start executing anything yet.
    ///
    /// The caller is expected to hold the instance lock already; this
    /// only wires components together.
    pub async fn start(config: OrchestratorConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir).with_context(|| {
            format!("Failed to create state directory: {}", config.state_dir.display())
        })?;

        let db = ductile_db::open_pool(&config.state_db_path())
            .await
            .context("Failed to open control-plane database")?;
        ductile_db::init_schema(&db)
            .await
            .context("Failed to initialize schema")?;

        let registry = Arc::new(
            PluginRegistry::load(&config.plugins_dir).context("Failed to load plugins")?,
        );
        let router =
            Arc::new(Router::load(&config.pipelines_dir).context("Failed to load pipelines")?);
        info!(
            "Sentinel ready: {} plugin(s), {} pipeline(s), {} worker(s)",
            registry.len(),
            router.pipelines().len(),
            config.workers
        );

        let queue: Arc<dyn QueueStore> =
            Arc::new(JobQueue::new(db.clone(), config.retry_policy()));
        let workspaces: Arc<dyn WorkspaceStore> =
            Arc::new(FsWorkspaces::new(config.workspaces_dir()));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            PluginStateStore::new(db.clone()),
            ContextStore::new(db.clone()),
            workspaces,
            registry,
            router,
            PluginRunner::new(),
            config.default_timeout(),
        ));

        let workers = WorkerPool::new(
            dispatcher,
            queue,
            config.workers,
            config.idle_poll(),
        );

        Ok(Self { config, workers })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drain the queue until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        self.workers.run(cancel).await;
    }
}
