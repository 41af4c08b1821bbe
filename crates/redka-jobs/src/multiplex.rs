//! Several workers bound to one queue.

use crate::error::JobError;
use crate::handler::Handlers;
use crate::worker::{Worker, WorkerState, WorkerStats};
use futures::future::join_all;

/// Group of workers sharing a queue, driven as one.
#[derive(Clone)]
pub struct WorkerMultiplex {
    queue: String,
    workers: Vec<Worker>,
}

impl std::fmt::Debug for WorkerMultiplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerMultiplex")
            .field("queue", &self.queue)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerMultiplex {
    pub fn new(queue: impl Into<String>, workers: Vec<Worker>) -> Self {
        Self {
            queue: queue.into(),
            workers,
        }
    }

    /// Fully-qualified queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Registers the same handlers on every member.
    pub fn register(&self, handlers: Handlers) {
        for worker in &self.workers {
            worker.register(handlers.clone());
        }
    }

    /// Installs the same error callback on every member.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&JobError) + Send + Sync + Clone + 'static,
    {
        for worker in &self.workers {
            worker.on_error(handler.clone());
        }
    }

    /// Stops every member; returns once all of them are stopped.
    pub async fn stop(&self) {
        join_all(self.workers.iter().map(Worker::stop)).await;
    }

    /// True once every member reached [`WorkerState::Stopped`].
    pub fn is_stopped(&self) -> bool {
        self.workers
            .iter()
            .all(|worker| worker.state() == WorkerState::Stopped)
    }

    /// Statistics summed over the members.
    pub fn stats(&self) -> WorkerStats {
        self.workers
            .iter()
            .map(Worker::stats)
            .fold(WorkerStats::default(), |acc, stats| WorkerStats {
                running: acc.running + stats.running,
                jobs_processed: acc.jobs_processed + stats.jobs_processed,
                jobs_failed: acc.jobs_failed + stats.jobs_failed,
            })
    }
}
