//! Shared plumbing for the fixed-interval background loops.

use crate::error::{JobError, JobResult};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Lifecycle of a background scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
    /// A loop hit a store error and every loop was halted.
    Failed(String),
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => f.write_str("idle"),
            SchedulerState::Running => f.write_str("running"),
            SchedulerState::Stopped => f.write_str("stopped"),
            SchedulerState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Start/stop/failure bookkeeping for one scheduler and its loops.
pub(crate) struct SchedulerControl {
    name: &'static str,
    state: watch::Sender<SchedulerState>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerControl {
    pub(crate) fn new(name: &'static str) -> Arc<Self> {
        let (state, _) = watch::channel(SchedulerState::Idle);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            name,
            state,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn state(&self) -> SchedulerState {
        self.state.borrow().clone()
    }

    /// Moves to `Running`, refusing a second start.
    pub(crate) fn begin(&self) -> JobResult<()> {
        let mut refused = false;
        self.state.send_if_modified(|state| {
            if *state == SchedulerState::Running {
                refused = true;
                false
            } else {
                *state = SchedulerState::Running;
                true
            }
        });
        if refused {
            return Err(JobError::Scheduler(format!("{} already running", self.name)));
        }
        info!(scheduler = self.name, "Scheduler started");
        Ok(())
    }

    /// Runs `tick` every `period` until stopped or until it fails.
    pub(crate) fn spawn_loop<F, Fut>(self: &Arc<Self>, loop_name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<()>> + Send + 'static,
    {
        let control = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = tick().await {
                            control.fail(loop_name, &e);
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.lock().push(handle);
    }

    /// Records a fatal error and halts every loop.
    pub(crate) fn fail(&self, loop_name: &str, err: &JobError) {
        error!(scheduler = self.name, task = loop_name, error = %err, "Scheduler failed");
        self.state
            .send_replace(SchedulerState::Failed(format!("{loop_name}: {err}")));
        let _ = self.shutdown_tx.send(());
    }

    /// Halts the loops after their in-flight tick.
    pub(crate) async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(scheduler = self.name, error = %e, "Scheduler task ended abnormally");
            }
        }
        self.state.send_if_modified(|state| {
            if matches!(state, SchedulerState::Failed(_)) {
                false
            } else {
                *state = SchedulerState::Stopped;
                true
            }
        });
        info!(scheduler = self.name, "Scheduler stopped");
    }

    /// Resolves once the scheduler halts: with the error that failed it, or
    /// with [`JobError::Cancelled`] after a normal stop.
    pub(crate) async fn fatal(&self) -> JobError {
        let mut rx = self.state.subscribe();
        let halted = rx
            .wait_for(|state| matches!(state, SchedulerState::Failed(_) | SchedulerState::Stopped))
            .await
            .map(|state| state.clone());
        match halted {
            Ok(SchedulerState::Failed(reason)) => {
                JobError::Scheduler(format!("{} failed: {reason}", self.name))
            }
            _ => JobError::Cancelled,
        }
    }
}
