//! Bounded worker pool draining the job queue.
//!
//! Task-per-job with a fixed number of workers: each job blocks its
//! worker on a plugin subprocess, so cooperative multiplexing would buy
//! nothing. Cancellation is cooperative - a worker finishes (or
//! terminates) its in-flight job, then exits its loop.

use crate::dispatcher::Dispatcher;
use ductile_runner::CancellationToken;
use ductile_state_store::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn QueueStore>,
    workers: usize,
    idle_poll: Duration,
}

impl WorkerPool {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        queue: Arc<dyn QueueStore>,
        workers: usize,
        idle_poll: Duration,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            workers: workers.max(1),
            idle_poll,
        }
    }

    /// Run until the token is cancelled and every worker has drained
    /// its in-flight job.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting {} worker(s)", self.workers);
        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let dispatcher = Arc::clone(&self.dispatcher);
            let queue = Arc::clone(&self.queue);
            let cancel = cancel.clone();
            let idle_poll = self.idle_poll;
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, dispatcher, queue, cancel, idle_poll).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("All workers stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn QueueStore>,
    cancel: CancellationToken,
    idle_poll: Duration,
) {
    info!("Worker {} started", worker_id);
    while !cancel.is_cancelled() {
        match queue.dequeue().await {
            Ok(Some(job)) => {
                if let Err(e) = dispatcher.execute(&job, &cancel).await {
                    // Could not even record an outcome; the job stays
                    // `running` for the operator to inspect.
                    error!("Worker {}: job {} outcome not recorded: {}", worker_id, job.id, e);
                }
            }
            Ok(None) => {
                tokio::time::sleep(idle_poll).await;
            }
            Err(e) => {
                warn!("Worker {}: dequeue failed: {}", worker_id, e);
                tokio::time::sleep(idle_poll).await;
            }
        }
    }
    info!("Worker {} stopped", worker_id);
}
