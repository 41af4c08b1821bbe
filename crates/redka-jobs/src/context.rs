//! Handler-facing view of a running job.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

/// Resolution progress of one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolutionState {
    Pending,
    RetryRequested,
    Resolved,
}

/// Ensures a job execution is resolved once.
///
/// Shared by the handler (through [`JobContext::retry_in`]), the slot that
/// awaits the handler, and the timeout timer. The first `resolve` wins.
pub(crate) struct Resolution {
    state: Mutex<ResolutionState>,
    resolved: watch::Sender<bool>,
}

impl Resolution {
    pub(crate) fn new() -> Self {
        let (resolved, _) = watch::channel(false);
        Self {
            state: Mutex::new(ResolutionState::Pending),
            resolved,
        }
    }

    /// Marks the execution resolved. Returns the previous state, or `None`
    /// if someone else resolved it first.
    pub(crate) fn resolve(&self) -> Option<ResolutionState> {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            *state = ResolutionState::Resolved;
            previous
        };
        if previous == ResolutionState::Resolved {
            return None;
        }
        self.resolved.send_replace(true);
        Some(previous)
    }

    pub(crate) fn state(&self) -> ResolutionState {
        *self.state.lock()
    }

    /// Completes once the execution has been resolved by anyone.
    pub(crate) async fn wait(&self) {
        let mut rx = self.resolved.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|resolved| *resolved).await;
    }
}

/// Capability handed to every handler invocation.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Mutex<Job>>,
    resolution: Arc<Resolution>,
}

impl JobContext {
    pub(crate) fn new(job: Arc<Mutex<Job>>, resolution: Arc<Resolution>) -> Self {
        Self { job, resolution }
    }

    pub fn job_id(&self) -> JobId {
        self.job.lock().id.clone()
    }

    /// Fully-qualified queue name.
    pub fn queue(&self) -> String {
        self.job.lock().queue.clone()
    }

    pub fn name(&self) -> String {
        self.job.lock().name.clone()
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.job.lock().attempt
    }

    /// Reschedules the job `delay_ms` from now instead of completing it.
    ///
    /// The handler's own return value is ignored once a retry was
    /// requested. Requesting a second retry, or retrying after the job was
    /// resolved (for instance by a timeout), fails with
    /// [`JobError::DoubleResolution`].
    pub fn retry_in(&self, delay_ms: u64) -> JobResult<()> {
        let mut state = self.resolution.state.lock();
        if *state != ResolutionState::Pending {
            let id = self.job.lock().id.clone();
            return Err(JobError::DoubleResolution(id.to_string()));
        }
        *state = ResolutionState::RetryRequested;
        self.job.lock().retry(delay_ms);
        Ok(())
    }

    /// Stores a note on the job; notes persist across retries.
    pub fn note(&self, key: impl Into<String>, val: Value) {
        self.job.lock().note(key, val);
    }

    pub fn look(&self, key: &str) -> Option<Value> {
        self.job.lock().look(key).cloned()
    }

    /// Snapshot of the job as currently held by the worker.
    pub fn job(&self) -> Job {
        self.job.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EnqueueOptions, JobStatus};
    use serde_json::json;

    fn context() -> (JobContext, Arc<Resolution>) {
        let job = Job::new("redka_q", "n", json!(1), &EnqueueOptions::default()).unwrap();
        let resolution = Arc::new(Resolution::new());
        (
            JobContext::new(Arc::new(Mutex::new(job)), resolution.clone()),
            resolution,
        )
    }

    #[test]
    fn test_retry_in_once() {
        let (ctx, resolution) = context();
        ctx.retry_in(100).unwrap();
        assert_eq!(resolution.state(), ResolutionState::RetryRequested);
        assert_eq!(ctx.job().status, Some(JobStatus::Retry));

        let err = ctx.retry_in(100).unwrap_err();
        assert!(matches!(err, JobError::DoubleResolution(_)));
    }

    #[test]
    fn test_first_resolve_wins() {
        let (ctx, resolution) = context();
        assert_eq!(resolution.resolve(), Some(ResolutionState::Pending));
        assert_eq!(resolution.resolve(), None);
        assert!(ctx.retry_in(10).is_err());
    }

    #[test]
    fn test_notes_visible_through_context() {
        let (ctx, _) = context();
        ctx.note("step", json!("upload"));
        assert_eq!(ctx.look("step"), Some(json!("upload")));
        assert_eq!(ctx.attempt(), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_after_resolve() {
        let (_, resolution) = context();
        let waiter = {
            let resolution = resolution.clone();
            tokio::spawn(async move { resolution.wait().await })
        };
        resolution.resolve();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
