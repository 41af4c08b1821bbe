//! Delayed job promotion and stale heartbeat recovery.

use crate::config::DelayConfig;
use crate::error::{JobError, JobResult};
use crate::events::{JobEventEmitter, JobEventType};
use crate::job::{iso, now_ms};
use crate::keys::KeySpace;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::{SchedulerControl, SchedulerState};
use crate::store::{Store, Sweep, SweepOutcome};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Moves due jobs off the delay list and reclaims jobs whose worker died.
///
/// Runs two independent loops at `poll_interval_ms`. Any store failure halts
/// both loops; the host should await [`DelayedJobsManager::fatal`].
#[derive(Clone)]
pub struct DelayedJobsManager {
    inner: Arc<DelayInner>,
}

struct DelayInner {
    store: Arc<dyn Store>,
    keys: KeySpace,
    emitter: JobEventEmitter,
    config: DelayConfig,
    keep_terminal_lists: bool,
    control: Arc<SchedulerControl>,
}

impl DelayedJobsManager {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        emitter: JobEventEmitter,
        config: DelayConfig,
        keep_terminal_lists: bool,
    ) -> Self {
        Self {
            inner: Arc::new(DelayInner {
                store,
                keys,
                emitter,
                config,
                keep_terminal_lists,
                control: SchedulerControl::new("delayed-jobs-manager"),
            }),
        }
    }

    /// Loads the scripts and starts both loops.
    pub async fn start(&self) -> JobResult<()> {
        self.inner.control.begin()?;
        if let Err(e) = self.inner.store.load_scripts().await {
            self.inner.control.fail("load-scripts", &e);
            return Err(e);
        }

        let period = self.inner.config.poll_interval();
        let promote = self.inner.clone();
        self.inner.control.spawn_loop("promote", period, move || {
            let inner = promote.clone();
            async move { inner.promote().await.map(|_| ()) }
        });
        let sweep = self.inner.clone();
        self.inner.control.spawn_loop("sweep", period, move || {
            let inner = sweep.clone();
            async move { inner.sweep().await.map(|_| ()) }
        });

        info!(
            poll_interval_ms = self.inner.config.poll_interval_ms,
            stale_after_ms = self.inner.config.stale_after_ms,
            "Delayed jobs manager started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.control.stop().await;
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.control.state()
    }

    /// Resolves once the manager halts: with its error, or with
    /// [`JobError::Cancelled`] after `stop`.
    pub async fn fatal(&self) -> JobError {
        self.inner.control.fatal().await
    }

    /// Runs one promotion pass; returns the promoted ids.
    pub async fn promote_once(&self) -> JobResult<Vec<String>> {
        self.inner.promote().await
    }

    /// Runs one heartbeat sweep.
    pub async fn sweep_once(&self) -> JobResult<SweepOutcome> {
        self.inner.sweep().await
    }
}

impl DelayInner {
    async fn promote(&self) -> JobResult<Vec<String>> {
        let promoted = self
            .store
            .promote_delayed(&self.keys.delay(), now_ms())
            .await?;

        if !promoted.is_empty() {
            debug!(count = promoted.len(), "Promoted delayed jobs");
            SchedulerMetrics::promoted(promoted.len());
        }
        for id in &promoted {
            self.emitter
                .emit_stored(JobEventType::Enqueued, &self.keys.job(id))
                .await;
        }
        Ok(promoted)
    }

    async fn sweep(&self) -> JobResult<SweepOutcome> {
        let now = Utc::now();
        let sweep = Sweep {
            registry: self.keys.queues(),
            now_ms: now.timestamp_millis(),
            now_iso: iso(now),
            stale_after_ms: self.config.stale_after_ms,
            max_stuck_attempts: self.config.max_stuck_attempts.unwrap_or(0),
            keep_terminal_lists: self.keep_terminal_lists,
        };
        let outcome = self.store.sweep_stale(&sweep).await?;

        let reclaimed = outcome.requeued.len() + outcome.failed.len();
        if reclaimed > 0 {
            SchedulerMetrics::reclaimed(reclaimed);
        }
        for id in &outcome.requeued {
            warn!(job_id = %id, "Requeued job after lost heartbeat");
            self.emitter
                .emit_stored(JobEventType::Retry, &self.keys.job(id))
                .await;
        }
        for id in &outcome.failed {
            warn!(job_id = %id, "Failed job after lost heartbeat");
            self.emitter
                .emit_stored(JobEventType::Failed, &self.keys.job(id))
                .await;
        }
        Ok(outcome)
    }
}
