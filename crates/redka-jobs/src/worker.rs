//! Queue worker: claims jobs, runs handlers, settles outcomes.

use crate::config::WorkerConfig;
use crate::context::{JobContext, Resolution, ResolutionState};
use crate::error::{JobError, JobResult};
use crate::events::JobEventEmitter;
use crate::handler::Handlers;
use crate::job::{iso, now_ms, Job, JobRecord, JobStatus};
use crate::keys::KeySpace;
use crate::metrics::JobMetrics;
use crate::store::{Settle, Store};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Per-job timeout; `None` disables it.
    pub timeout: Option<Duration>,

    /// Number of polling slots.
    pub parallel: usize,

    /// Wait before retrying a dequeue while another slot is blocked.
    pub spinup: Duration,

    /// Heartbeat refresh interval while a job runs.
    pub heartbeat_interval: Duration,

    /// Blocking pop timeout.
    pub dequeue_timeout: Duration,

    /// Push finished ids onto the legacy terminal lists.
    pub keep_terminal_lists: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl WorkerOptions {
    /// Rejects options a worker cannot run with: zero heartbeat, dequeue
    /// or job timeout.
    pub fn validate(&self) -> JobResult<()> {
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(JobError::Configuration(
                "Worker timeout must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(JobError::Configuration(
                "Worker heartbeat interval must be positive".to_string(),
            ));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(JobError::Configuration(
                "Worker dequeue timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            timeout: config.timeout(),
            parallel: config.parallel.max(1),
            spinup: config.spinup(),
            heartbeat_interval: config.heartbeat_interval(),
            dequeue_timeout: config.dequeue_timeout(),
            keep_terminal_lists: true,
        }
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Polling,
    Working,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Init => "INIT",
            WorkerState::Polling => "POLLING",
            WorkerState::Working => "WORKING",
            WorkerState::Stopping => "STOPPING",
            WorkerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Callback for store errors hit while polling.
pub type ErrorHandler = Arc<dyn Fn(&JobError) + Send + Sync>;

/// Worker statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub running: usize,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
}

/// Polls one queue and runs its jobs.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    id: String,
    queue: String,
    store: Arc<dyn Store>,
    keys: KeySpace,
    emitter: JobEventEmitter,
    options: WorkerOptions,
    handlers: RwLock<Handlers>,
    on_error: RwLock<Option<ErrorHandler>>,
    state: Mutex<WorkerState>,
    running: AtomicUsize,
    pending_dequeue: AtomicBool,
    timeouts: Mutex<HashMap<String, AbortHandle>>,
    slots: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
}

impl Worker {
    /// Create a worker for the fully-qualified `queue`. Polling starts with
    /// the first [`Worker::register`].
    pub fn new(
        queue: impl Into<String>,
        store: Arc<dyn Store>,
        keys: KeySpace,
        emitter: JobEventEmitter,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(WorkerInner {
                id: format!("worker-{}", Uuid::new_v4().simple()),
                queue: queue.into(),
                store,
                keys,
                emitter,
                options,
                handlers: RwLock::new(Handlers::new()),
                on_error: RwLock::new(None),
                state: Mutex::new(WorkerState::Init),
                running: AtomicUsize::new(0),
                pending_dequeue: AtomicBool::new(false),
                timeouts: Mutex::new(HashMap::new()),
                slots: Mutex::new(Vec::new()),
                shutdown_tx,
                jobs_processed: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Fully-qualified queue name.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.lock()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            running: self.inner.running.load(Ordering::SeqCst),
            jobs_processed: self.inner.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.inner.jobs_failed.load(Ordering::Relaxed),
        }
    }

    /// Merges `handlers` by job name. The first call starts the polling slots.
    pub fn register(&self, handlers: Handlers) {
        self.inner.handlers.write().extend(handlers);

        let mut state = self.inner.state.lock();
        if *state != WorkerState::Init {
            return;
        }
        *state = WorkerState::Polling;
        drop(state);

        let mut slots = self.inner.slots.lock();
        for slot in 0..self.inner.options.parallel {
            let inner = self.inner.clone();
            slots.push(tokio::spawn(async move { inner.run_slot(slot).await }));
        }

        info!(
            worker_id = %self.inner.id,
            queue = %self.inner.queue,
            parallel = self.inner.options.parallel,
            "Worker started"
        );
    }

    /// Installs a callback for store errors hit while polling.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&JobError) + Send + Sync + 'static,
    {
        *self.inner.on_error.write() = Some(Arc::new(handler));
    }

    /// Stops polling and waits for every slot to finish its current job.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                WorkerState::Stopped => return,
                WorkerState::Init => {
                    *state = WorkerState::Stopped;
                    return;
                }
                _ => *state = WorkerState::Stopping,
            }
        }

        info!(worker_id = %self.inner.id, queue = %self.inner.queue, "Stopping worker");
        let _ = self.inner.shutdown_tx.send(());

        let slots: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.slots.lock());
        for result in futures::future::join_all(slots).await {
            if let Err(e) = result {
                error!(worker_id = %self.inner.id, error = %e, "Worker slot ended abnormally");
            }
        }

        *self.inner.state.lock() = WorkerState::Stopped;
        info!(worker_id = %self.inner.id, queue = %self.inner.queue, "Worker stopped");
    }
}

impl WorkerInner {
    fn is_stopping(&self) -> bool {
        matches!(
            *self.state.lock(),
            WorkerState::Stopping | WorkerState::Stopped
        )
    }

    async fn run_slot(self: Arc<Self>, slot: usize) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        debug!(worker_id = %self.id, slot, "Slot polling");

        while !self.is_stopping() {
            match self.dequeue().await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => {
                    self.handle_error(&e);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        () = tokio::time::sleep(self.options.spinup) => {}
                    }
                }
            }
        }

        debug!(worker_id = %self.id, slot, "Slot exited");
    }

    /// Claims the next job, stamping it as dequeued.
    async fn dequeue(&self) -> JobResult<Option<Job>> {
        if self.is_stopping() {
            return Ok(None);
        }
        if self.pending_dequeue.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.options.spinup).await;
            return Ok(None);
        }

        let progress = KeySpace::progress(&self.queue);
        let claimed = self
            .store
            .claim(&KeySpace::pending(&self.queue), &progress, self.options.dequeue_timeout)
            .await;
        self.pending_dequeue.store(false, Ordering::SeqCst);
        let Some(job_id) = claimed? else {
            return Ok(None);
        };

        let mut fields = JobRecord::new();
        fields.insert("dequeued".into(), iso(Utc::now()));
        fields.insert("heartbeat".into(), now_ms().to_string());
        fields.insert("status".into(), JobStatus::Dequeued.to_string());

        let job = match self.store.update(&self.keys.job(&job_id), &fields).await? {
            Some(record) => Job::from_record(&record),
            None => Err(JobError::NotFound(job_id.clone())),
        };

        match job {
            Ok(job) => {
                debug!(job_id = %job.id, queue = %self.queue, attempt = job.attempt, "Dequeued job");
                Ok(Some(job))
            }
            Err(e) => {
                warn!(job_id = %job_id, queue = %self.queue, error = %e, "Dropping unreadable job");
                self.store.remove(&progress, &job_id).await?;
                Ok(None)
            }
        }
    }

    async fn process(self: &Arc<Self>, job: Job) {
        let started = Instant::now();
        self.running.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Polling {
                *state = WorkerState::Working;
            }
        }

        let shared = Arc::new(Mutex::new(job.clone()));
        let resolution = Arc::new(Resolution::new());
        self.arm_timeout(&job, shared.clone(), resolution.clone());
        self.emitter.job_dequeued(&job).await;

        let heartbeat = self.spawn_heartbeat(&job);
        let outcome = self.work(&job, shared.clone(), resolution.clone()).await;
        heartbeat.abort();

        if let Some((previous, result)) = outcome {
            let current = shared.lock().clone();
            let label = match (previous, result) {
                (ResolutionState::RetryRequested, _) => {
                    self.retry(current).await;
                    "retry"
                }
                (_, Ok(value)) => {
                    self.complete(current, value).await;
                    "complete"
                }
                (_, Err(e)) => {
                    self.fail(current, e).await;
                    "failed"
                }
            };
            JobMetrics::job_duration(&job.queue, &job.name, label, started.elapsed());
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state == WorkerState::Working && self.running.load(Ordering::SeqCst) == 0 {
            *state = WorkerState::Polling;
        }
    }

    /// Runs the handler. Returns `None` if the job was resolved elsewhere
    /// (by the timeout) while the handler was running.
    async fn work(
        &self,
        job: &Job,
        shared: Arc<Mutex<Job>>,
        resolution: Arc<Resolution>,
    ) -> Option<(ResolutionState, JobResult<Value>)> {
        let handler = self.handlers.read().get(&job.name);
        let Some(handler) = handler else {
            warn!(job_id = %job.id, queue = %job.queue, name = %job.name, "No handler registered");
            let err = JobError::NoHandler {
                queue: job.queue.clone(),
                name: job.name.clone(),
            };
            return resolution.resolve().map(|previous| (previous, Err(err)));
        };

        let ctx = JobContext::new(shared, resolution.clone());
        let mut task = tokio::spawn(handler(job.params.clone(), ctx));

        let joined = tokio::select! {
            joined = &mut task => joined,
            () = resolution.wait() => {
                debug!(job_id = %job.id, "Job resolved while handler still running");
                return None;
            }
        };

        let previous = resolution.resolve()?;
        let result = match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(JobError::handler(&e)),
            Err(e) => Err(panic_error(e)),
        };
        Some((previous, result))
    }

    async fn complete(&self, mut job: Job, result: Value) {
        self.clear_timeout(job.id.as_str());

        let now = Utc::now();
        let mut fields = JobRecord::new();
        fields.insert("status".into(), JobStatus::Complete.to_string());
        fields.insert("complete".into(), iso(now));
        fields.insert("result".into(), result.to_string());
        fields.insert("notes".into(), Value::Object(job.notes.clone()).to_string());
        let target = self
            .options
            .keep_terminal_lists
            .then(|| KeySpace::complete(&self.queue));

        match self.store.settle(&self.settle(&job, fields, target)).await {
            Ok(true) => {
                job.status = Some(JobStatus::Complete);
                job.complete = Some(now);
                job.result = Some(result);
                job.heartbeat = None;
                self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %job.id, queue = %job.queue, name = %job.name, attempt = job.attempt, "Job completed");
                self.emitter.job_complete(&job).await;
            }
            Ok(false) => debug!(job_id = %job.id, "Job already settled, completion dropped"),
            Err(e) => self.handle_error(&e),
        }
    }

    async fn fail(&self, mut job: Job, err: JobError) {
        self.clear_timeout(job.id.as_str());

        let now = Utc::now();
        let message = err.to_string();
        let stack = err.stack();
        let mut fields = JobRecord::new();
        fields.insert("status".into(), JobStatus::Failed.to_string());
        fields.insert("failed".into(), iso(now));
        fields.insert("error".into(), message.clone());
        fields.insert("stack".into(), stack.clone());
        fields.insert("notes".into(), Value::Object(job.notes.clone()).to_string());
        let target = self
            .options
            .keep_terminal_lists
            .then(|| KeySpace::failed(&self.queue));

        match self.store.settle(&self.settle(&job, fields, target)).await {
            Ok(true) => {
                job.status = Some(JobStatus::Failed);
                job.failed = Some(now);
                job.error = Some(message);
                job.stack = Some(stack);
                job.heartbeat = None;
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job.id, queue = %job.queue, name = %job.name, attempt = job.attempt, error = %err, "Job failed");
                self.emitter.job_failed(&job).await;
            }
            Ok(false) => debug!(job_id = %job.id, "Job already settled, failure dropped"),
            Err(e) => self.handle_error(&e),
        }
    }

    async fn retry(&self, mut job: Job) {
        self.clear_timeout(job.id.as_str());

        let attempt = job.attempt + 1;
        let mut fields = JobRecord::new();
        fields.insert("attempt".into(), attempt.to_string());
        fields.insert("delay".into(), job.delay.to_string());
        fields.insert("status".into(), JobStatus::Retry.to_string());
        fields.insert("notes".into(), Value::Object(job.notes.clone()).to_string());
        let target = Some(self.keys.delay());

        match self.store.settle(&self.settle(&job, fields, target)).await {
            Ok(true) => {
                job.attempt = attempt;
                job.heartbeat = None;
                info!(job_id = %job.id, queue = %job.queue, attempt, delay = job.delay, "Job scheduled for retry");
                self.emitter.job_retry(&job).await;
            }
            Ok(false) => debug!(job_id = %job.id, "Job already settled, retry dropped"),
            Err(e) => {
                self.handle_error(&e);
                self.fail(job, e).await;
            }
        }
    }

    fn settle(&self, job: &Job, fields: JobRecord, target: Option<String>) -> Settle {
        Settle {
            progress: KeySpace::progress(&self.queue),
            job_key: self.keys.job(job.id.as_str()),
            job_id: job.id.to_string(),
            fields,
            clear: vec!["heartbeat".to_string()],
            target,
        }
    }

    fn arm_timeout(self: &Arc<Self>, job: &Job, shared: Arc<Mutex<Job>>, resolution: Arc<Resolution>) {
        let Some(timeout) = self.options.timeout else {
            return;
        };

        let inner = self.clone();
        let job_id = job.id.to_string();
        let timer_id = job_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Drop our own entry first so the fail below cannot abort this task.
            inner.timeouts.lock().remove(&timer_id);
            if resolution.resolve().is_some() {
                let job = shared.lock().clone();
                JobMetrics::job_timed_out(&job.queue, &job.name);
                warn!(job_id = %job.id, queue = %job.queue, timeout_ms = timeout.as_millis() as u64, "Job timed out");
                inner.fail(job, JobError::WorkerTimedOut).await;
            }
        });

        self.timeouts.lock().insert(job_id, handle.abort_handle());
    }

    fn clear_timeout(&self, job_id: &str) {
        if let Some(handle) = self.timeouts.lock().remove(job_id) {
            handle.abort();
        }
    }

    fn spawn_heartbeat(&self, job: &Job) -> JoinHandle<()> {
        let store = self.store.clone();
        let job_key = self.keys.job(job.id.as_str());
        let period = self.options.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut fields = JobRecord::new();
                fields.insert("heartbeat".into(), now_ms().to_string());
                match store.update(&job_key, &fields).await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => warn!(job_id = %job_key, error = %e, "Failed to refresh heartbeat"),
                }
            }
        })
    }

    fn handle_error(&self, err: &JobError) {
        error!(worker_id = %self.id, queue = %self.queue, error = %err, "Worker error");
        let handler = self.on_error.read().clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }
}

fn panic_error(err: JoinError) -> JobError {
    if !err.is_panic() {
        return JobError::Internal(format!("Handler task ended: {err}"));
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Handler panicked".to_string());
    JobError::Handler {
        message,
        stack: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EnqueueOptions;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn options() -> WorkerOptions {
        WorkerOptions {
            timeout: None,
            parallel: 1,
            spinup: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            dequeue_timeout: Duration::from_millis(50),
            keep_terminal_lists: true,
        }
    }

    #[test]
    fn test_options_reject_zero_durations() {
        assert!(options().validate().is_ok());

        let zero_timeout = WorkerOptions {
            timeout: Some(Duration::ZERO),
            ..options()
        };
        let err = zero_timeout.validate().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("timeout"));

        let zero_heartbeat = WorkerOptions {
            heartbeat_interval: Duration::ZERO,
            ..options()
        };
        assert!(zero_heartbeat.validate().unwrap_err().to_string().contains("heartbeat"));

        let zero_dequeue = WorkerOptions {
            dequeue_timeout: Duration::ZERO,
            ..options()
        };
        assert!(zero_dequeue.validate().is_err());
    }

    fn worker(store: &Arc<MemoryStore>, options: WorkerOptions) -> Worker {
        let store: Arc<dyn Store> = store.clone();
        Worker::new(
            "redka_test",
            store.clone(),
            KeySpace::default(),
            JobEventEmitter::new(store),
            options,
        )
    }

    async fn seed(store: &MemoryStore, name: &str, params: Value) -> Job {
        let job = Job::new("redka_test", name, params, &EnqueueOptions::default()).unwrap();
        store
            .insert(job.id.as_str(), job.id.as_str(), &job.to_record(), "redka_test_pending")
            .await
            .unwrap();
        job
    }

    async fn wait_for_status(store: &MemoryStore, id: &str, status: &str) -> JobRecord {
        for _ in 0..100 {
            if let Some(record) = store.read(id).await.unwrap() {
                if record.get("status").map(String::as_str) == Some(status) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_completes_job() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store, options());
        worker.register(Handlers::new().on("world", |params, _| async move {
            Ok(json!(format!("hello {}", params.as_str().unwrap_or_default())))
        }));

        let job = seed(&store, "world", json!("redka")).await;
        let record = wait_for_status(&store, job.id.as_str(), "complete").await;
        assert_eq!(record.get("result").map(String::as_str), Some("\"hello redka\""));
        assert!(!record.contains_key("heartbeat"));
        assert!(store.range("redka_test_progress").await.unwrap().is_empty());
        assert_eq!(store.range("redka_test_complete").await.unwrap(), vec![job.id.to_string()]);

        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.stats().jobs_processed, 1);
    }

    #[tokio::test]
    async fn test_handler_error_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store, options());
        worker.register(Handlers::new().on("boom", |_, _| async move {
            Err(anyhow::anyhow!("ERR"))
        }));

        let job = seed(&store, "boom", Value::Null).await;
        let record = wait_for_status(&store, job.id.as_str(), "failed").await;
        assert_eq!(record.get("error").map(String::as_str), Some("ERR"));
        assert_eq!(store.range("redka_test_failed").await.unwrap(), vec![job.id.to_string()]);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_panic_fails_job_and_worker_survives() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store, options());
        worker.register(
            Handlers::new()
                .on("panic", |_, _| async move { panic!("handler exploded") })
                .on("ok", |_, _| async move { Ok(json!(1)) }),
        );

        let bad = seed(&store, "panic", Value::Null).await;
        let record = wait_for_status(&store, bad.id.as_str(), "failed").await;
        assert_eq!(record.get("error").map(String::as_str), Some("handler exploded"));

        let good = seed(&store, "ok", Value::Null).await;
        wait_for_status(&store, good.id.as_str(), "complete").await;
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store, options());
        worker.register(Handlers::new());

        let job = seed(&store, "unknown", Value::Null).await;
        let record = wait_for_status(&store, job.id.as_str(), "failed").await;
        assert_eq!(
            record.get("error").map(String::as_str),
            Some("No callback registered for job redka_test unknown")
        );
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let mut opts = options();
        opts.timeout = Some(Duration::from_millis(100));
        let worker = worker(&store, opts);
        worker.register(Handlers::new().on("slow", |_, _| async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            Ok(json!("late"))
        }));

        let job = seed(&store, "slow", Value::Null).await;
        let record = wait_for_status(&store, job.id.as_str(), "failed").await;
        assert_eq!(record.get("error").map(String::as_str), Some("Worker timed out"));

        tokio::time::sleep(Duration::from_millis(700)).await;
        let record = store.read(job.id.as_str()).await.unwrap().unwrap();
        assert_eq!(record.get("status").map(String::as_str), Some("failed"));
        assert!(!record.contains_key("result"));
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_retry_moves_to_delay_list() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store, options());
        worker.register(Handlers::new().on("again", |_, ctx| async move {
            ctx.note("seen", json!(true));
            ctx.retry_in(10_000)?;
            Ok(json!("ignored"))
        }));

        let job = seed(&store, "again", Value::Null).await;
        let record = wait_for_status(&store, job.id.as_str(), "retry").await;
        assert_eq!(record.get("attempt").map(String::as_str), Some("2"));
        assert_eq!(record.get("notes").map(String::as_str), Some("{\"seen\":true}"));
        assert_eq!(store.range("redka__global-delay").await.unwrap(), vec![job.id.to_string()]);
        assert!(store.range("redka_test_progress").await.unwrap().is_empty());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_refreshed_while_running() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store, options());
        worker.register(Handlers::new().on("long", |_, _| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Value::Null)
        }));

        let job = seed(&store, "long", Value::Null).await;
        let first = wait_for_status(&store, job.id.as_str(), "dequeued").await;
        let first_beat: i64 = first["heartbeat"].parse().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let later = store.read(job.id.as_str()).await.unwrap().unwrap();
        let later_beat: i64 = later["heartbeat"].parse().unwrap();
        assert!(later_beat > first_beat);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_orphan_id_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        store.push("redka_test_pending", "ghost").await.unwrap();
        let worker = worker(&store, options());
        worker.register(Handlers::new());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.range("redka_test_progress").await.unwrap().is_empty());
        assert!(store.range("redka_test_pending").await.unwrap().is_empty());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_before_register() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store, options());
        assert_eq!(worker.state(), WorkerState::Init);
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_parallel_slots_run_concurrently() {
        let store = Arc::new(MemoryStore::new());
        let mut opts = options();
        opts.parallel = 3;
        let worker = worker(&store, opts);
        worker.register(Handlers::new().on("nap", |_, _| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Value::Null)
        }));

        let started = Instant::now();
        let mut jobs = Vec::new();
        for _ in 0..3 {
            jobs.push(seed(&store, "nap", Value::Null).await);
        }
        for job in &jobs {
            wait_for_status(&store, job.id.as_str(), "complete").await;
        }
        assert!(started.elapsed() < Duration::from_millis(850));
        worker.stop().await;
    }
}
