//! Per-job execution: the one place where queue, stores, workspaces,
//! router, and runner compose.
//!
//! The dispatcher is also the only translator from typed component
//! errors into job-level fail/retry decisions. Nothing below it decides
//! a job's fate; nothing above it sees component error types.

use crate::registry::{PluginHandle, PluginRegistry};
use crate::router::{Router, Step};
use chrono::Utc;
use ductile_ids::EventContextId;
use ductile_protocol::{
    Command, LogLevel, Request, Response, StampedEvent, PROTOCOL_VERSION,
};
use ductile_runner::{CancellationToken, PluginRunner};
use ductile_state_store::{
    ContextStore, EnqueueRequest, EventContext, JobRecord, JobStatus, PluginStateStore,
    QueueStore, StoreResult,
};
use ductile_workspace::{Workspace, WorkspaceError, WorkspaceStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How one hop ended, before the queue is told about it.
enum HopOutcome {
    Completed { children: usize },
    Failed { error: String, retryable: bool },
}

pub struct Dispatcher {
    queue: Arc<dyn QueueStore>,
    states: PluginStateStore,
    contexts: ContextStore,
    workspaces: Arc<dyn WorkspaceStore>,
    registry: Arc<PluginRegistry>,
    router: Arc<Router>,
    runner: PluginRunner,
    default_timeout: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueueStore>,
        states: PluginStateStore,
        contexts: ContextStore,
        workspaces: Arc<dyn WorkspaceStore>,
        registry: Arc<PluginRegistry>,
        router: Arc<Router>,
        runner: PluginRunner,
        default_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            states,
            contexts,
            workspaces,
            registry,
            router,
            runner,
            default_timeout,
        }
    }

    /// Execute one claimed job to a terminal-or-requeued state.
    ///
    /// Every failure path ends in `Queue::fail` with a retry decision;
    /// only an unreachable database escapes as an error, in which case
    /// the worker loop logs it and the job stays `running` until an
    /// operator intervenes (in-flight jobs are not recovered across
    /// restarts by design).
    pub async fn execute(
        &self,
        job: &JobRecord,
        cancel: &CancellationToken,
    ) -> StoreResult<JobStatus> {
        let outcome = match self.attempt(job, cancel).await {
            Ok(outcome) => outcome,
            // Store-level rejection (origin anchor, size cap, missing
            // context). Deterministic ones fail the job; transient
            // database errors retry it.
            Err(e) => HopOutcome::Failed {
                error: e.to_string(),
                retryable: e.is_retryable(),
            },
        };

        match outcome {
            HopOutcome::Completed { children } => {
                self.queue.complete(&job.id).await?;
                info!(
                    "Job {} succeeded ({} child job(s) enqueued)",
                    job.id, children
                );
                Ok(JobStatus::Succeeded)
            }
            HopOutcome::Failed { error, retryable } => {
                let status = self.queue.fail(&job.id, &error, retryable).await?;
                warn!("Job {} -> {}: {}", job.id, status, error);
                Ok(status)
            }
        }
    }

    async fn attempt(
        &self,
        job: &JobRecord,
        cancel: &CancellationToken,
    ) -> StoreResult<HopOutcome> {
        let Some(plugin) = self.registry.get(&job.plugin) else {
            return Ok(HopOutcome::Failed {
                error: format!("unknown plugin: {}", job.plugin),
                retryable: false,
            });
        };
        let command = match job.parsed_command() {
            Ok(command) => command,
            Err(e) => {
                return Ok(HopOutcome::Failed {
                    error: e,
                    retryable: false,
                })
            }
        };
        if !plugin.supports(command) {
            return Ok(HopOutcome::Failed {
                error: format!(
                    "plugin {} does not support the {} command",
                    job.plugin, command
                ),
                retryable: false,
            });
        }

        let state = self.states.get(&job.plugin).await?;
        let context = match &job.event_context_id {
            None => None,
            Some(id) => Some(
                self.contexts
                    .get(&EventContextId::from_string(id.clone()))
                    .await?,
            ),
        };
        let step = context
            .as_ref()
            .and_then(|c| self.router.step(&c.pipeline_name, &c.step_id));

        let workspace = match self.prepare_workspace(job, step) {
            Ok(workspace) => workspace,
            Err(e) => {
                return Ok(HopOutcome::Failed {
                    error: e.to_string(),
                    retryable: false,
                })
            }
        };

        let request = build_request(job, command, plugin, step, &state, context.as_ref(), &workspace, self.default_timeout);
        let deadline = request.deadline_at;

        debug!(
            "Dispatching job {} to {} ({} until {})",
            job.id,
            plugin.entrypoint_path().display(),
            command,
            deadline
        );

        let response = match self
            .runner
            .run(&plugin.entrypoint_path(), &request, deadline, cancel)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(HopOutcome::Failed {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                })
            }
        };

        if response.is_error() {
            let retryable = response.should_retry();
            return Ok(HopOutcome::Failed {
                error: response
                    .error
                    .unwrap_or_else(|| "plugin reported an error".to_string()),
                retryable,
            });
        }

        self.apply_success(job, &response, context.as_ref()).await
    }

    /// Apply a successful response: merge state, persist logs, route
    /// events into child contexts and child jobs, in that order.
    async fn apply_success(
        &self,
        job: &JobRecord,
        response: &Response,
        context: Option<&EventContext>,
    ) -> StoreResult<HopOutcome> {
        if !response.state_updates.is_empty() {
            self.states
                .shallow_merge(&job.plugin, &response.state_updates)
                .await?;
        }

        for entry in &response.logs {
            forward_plugin_log(&job.plugin, &job.id, entry.level, &entry.message);
        }

        let parent_ctx_id = job
            .event_context_id
            .as_ref()
            .map(|id| EventContextId::from_string(id.clone()));

        let mut children = 0;
        for emitted in response.events.clone() {
            let stamped = StampedEvent::stamp(emitted, &job.plugin, Utc::now());
            let matches = self.router.match_event(&stamped.event_type, context);
            if matches.is_empty() {
                debug!(
                    "Event {} from job {} matched no pipeline step",
                    stamped.event_type, job.id
                );
                continue;
            }

            for matched in matches {
                let updates = matched.context_updates(&stamped.payload);
                let child_ctx = self
                    .contexts
                    .create(
                        parent_ctx_id.as_ref(),
                        matched.pipeline_name,
                        &matched.step.id,
                        &updates,
                    )
                    .await?;

                let mut req = EnqueueRequest::new(matched.step.uses.clone(), Command::Handle);
                req.parent_job_id = Some(ductile_ids::JobId::from_string(job.id.clone()));
                req.source_event_id = Some(stamped.event_id.clone());
                req.event_context_id = Some(child_ctx.id.clone());
                req.submitted_by = format!("plugin:{}", job.plugin);
                req.payload = serde_json::to_value(&stamped).ok();
                let child_id = self.queue.enqueue(req).await?;

                debug!(
                    "Routed {} -> {}/{} as job {}",
                    stamped.event_type, matched.pipeline_name, matched.step.id, child_id
                );
                children += 1;
            }
        }

        Ok(HopOutcome::Completed { children })
    }

    /// Obtain the job's workspace.
    ///
    /// An existing directory is reused (retry attempts, or a re-run
    /// after a crash landed between mkdir and the status update).
    /// Otherwise: a step marked `clone: true` branches the parent's
    /// tree; everything else starts empty. Created unconditionally so
    /// `workspace_dir` always points at a real directory.
    fn prepare_workspace(
        &self,
        job: &JobRecord,
        step: Option<&Step>,
    ) -> Result<Workspace, WorkspaceError> {
        match self.workspaces.open(&job.id) {
            Ok(workspace) => return Ok(workspace),
            Err(WorkspaceError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if step.map(|s| s.clone).unwrap_or(false) {
            if let Some(parent) = &job.parent_job_id {
                return self.workspaces.clone_tree(parent, &job.id);
            }
        }
        self.workspaces.create(&job.id)
    }
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    job: &JobRecord,
    command: Command,
    plugin: &PluginHandle,
    step: Option<&Step>,
    state: &Map<String, Value>,
    context: Option<&EventContext>,
    workspace: &Workspace,
    default_timeout: Duration,
) -> Request {
    let mut config = plugin.manifest.config.clone();
    if let Some(step) = step {
        for (key, value) in &step.with {
            config.insert(key.clone(), value.clone());
        }
    }

    let event = if command == Command::Handle {
        job.payload()
            .and_then(|p| serde_json::from_value::<StampedEvent>(p).ok())
    } else {
        None
    };

    let timeout = plugin.timeout(default_timeout);
    let deadline_at = Utc::now()
        + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(60));

    Request {
        protocol: PROTOCOL_VERSION,
        job_id: job.id.clone(),
        command,
        config,
        state: state.clone(),
        context: context.map(|c| c.accumulated.clone()),
        workspace_dir: Some(workspace.dir.display().to_string()),
        event,
        deadline_at,
    }
}

/// Re-emit a plugin log line through our own tracing pipeline, tagged
/// with its origin.
fn forward_plugin_log(plugin: &str, job_id: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(plugin, job_id, "{}", message),
        LogLevel::Info => info!(plugin, job_id, "{}", message),
        LogLevel::Warn => warn!(plugin, job_id, "{}", message),
        LogLevel::Error => error!(plugin, job_id, "{}", message),
    }
}
