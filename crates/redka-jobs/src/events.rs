//! Job lifecycle events over store pub/sub.

use crate::error::{JobError, JobResult};
use crate::job::{iso, Job, JobRecord};
use crate::keys::{KeySpace, EVENT_CHANNEL_PREFIX};
use crate::metrics::JobMetrics;
use crate::store::Store;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// First wait before resubscribing after the event stream ended.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound of the doubling resubscribe wait.
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventType {
    Enqueued,
    Dequeued,
    Retry,
    Complete,
    Failed,
}

impl JobEventType {
    /// Every event type.
    pub const ALL: [JobEventType; 5] = [
        JobEventType::Enqueued,
        JobEventType::Dequeued,
        JobEventType::Retry,
        JobEventType::Complete,
        JobEventType::Failed,
    ];

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Enqueued => "ENQUEUED",
            JobEventType::Dequeued => "DEQUEUED",
            JobEventType::Retry => "RETRY",
            JobEventType::Complete => "COMPLETE",
            JobEventType::Failed => "FAILED",
        }
    }

    /// Channel the event type is published on.
    pub fn channel(&self) -> String {
        KeySpace::channel(self.as_str())
    }
}

impl fmt::Display for JobEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobEventType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| JobError::InvalidArgument(format!("Unknown event type: {s}")))
    }
}

/// Message published for every lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: JobEventType,
    pub timestamp: String,
    pub job: JobRecord,
}

/// Publishes lifecycle events.
#[derive(Clone)]
pub struct JobEventEmitter {
    store: Arc<dyn Store>,
}

impl JobEventEmitter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Publishes an event for `job`. Failures are logged, never returned.
    pub async fn emit(&self, kind: JobEventType, job: &Job) {
        match kind {
            JobEventType::Enqueued => JobMetrics::job_enqueued(&job.queue, &job.name),
            JobEventType::Dequeued => JobMetrics::job_dequeued(&job.queue, &job.name),
            JobEventType::Retry => JobMetrics::job_retried(&job.queue, &job.name, job.attempt),
            JobEventType::Complete => JobMetrics::job_completed(&job.queue, &job.name),
            JobEventType::Failed => JobMetrics::job_failed(&job.queue, &job.name),
        }
        self.emit_record(kind, job.to_record()).await;
    }

    /// Publishes an event carrying a raw record.
    pub async fn emit_record(&self, kind: JobEventType, record: JobRecord) {
        let job_id = record.get("id").cloned().unwrap_or_default();
        let event = JobEvent {
            kind,
            timestamp: iso(Utc::now()),
            job: record,
        };

        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job_id, event = %kind, error = %e, "Failed to encode job event");
                return;
            }
        };

        if let Err(e) = self.store.publish(&kind.channel(), &payload).await {
            warn!(job_id = %job_id, event = %kind, error = %e, "Failed to publish job event");
        } else {
            debug!(job_id = %job_id, event = %kind, "Published job event");
        }
    }

    /// Reads the stored record of `job_id` and publishes it.
    pub async fn emit_stored(&self, kind: JobEventType, job_key: &str) {
        match self.store.read(job_key).await {
            Ok(Some(record)) => match Job::from_record(&record) {
                Ok(job) => self.emit(kind, &job).await,
                Err(_) => self.emit_record(kind, record).await,
            },
            Ok(None) => debug!(job_id = %job_key, event = %kind, "Job vanished before its event"),
            Err(e) => warn!(job_id = %job_key, event = %kind, error = %e, "Failed to read job for event"),
        }
    }

    pub async fn job_enqueued(&self, job: &Job) {
        self.emit(JobEventType::Enqueued, job).await;
    }

    pub async fn job_dequeued(&self, job: &Job) {
        self.emit(JobEventType::Dequeued, job).await;
    }

    pub async fn job_retry(&self, job: &Job) {
        self.emit(JobEventType::Retry, job).await;
    }

    pub async fn job_complete(&self, job: &Job) {
        self.emit(JobEventType::Complete, job).await;
    }

    pub async fn job_failed(&self, job: &Job) {
        self.emit(JobEventType::Failed, job).await;
    }
}

/// Callback invoked for every received event of its type.
pub type EventCallback = Arc<dyn Fn(&Job) + Send + Sync>;

type CallbackMap = RwLock<HashMap<JobEventType, HashMap<u64, EventCallback>>>;

/// Handle to one registered callback.
pub struct Subscription {
    id: u64,
    kind: JobEventType,
    callbacks: Weak<CallbackMap>,
}

impl Subscription {
    /// Event type this subscription listens to.
    pub fn kind(&self) -> JobEventType {
        self.kind
    }

    /// Removes this callback only. Returns false if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        let Some(callbacks) = self.callbacks.upgrade() else {
            return false;
        };
        let mut callbacks = callbacks.write();
        callbacks
            .get_mut(&self.kind)
            .is_some_and(|registered| registered.remove(&self.id).is_some())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Dispatches received events to local callbacks.
pub struct JobEventReceiver {
    store: Arc<dyn Store>,
    callbacks: Arc<CallbackMap>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobEventReceiver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            task: Mutex::new(None),
        }
    }

    /// Subscribes to every event channel and starts dispatching.
    ///
    /// Returns once the subscription is active, so events published after
    /// this call are delivered. If the stream ends later (a dropped pub/sub
    /// connection), the receiver subscribes again with a doubling backoff.
    /// Events published while it is disconnected are lost.
    pub async fn start(&self) -> JobResult<()> {
        if self.task.lock().is_some() {
            return Ok(());
        }

        let channels: Vec<String> = JobEventType::ALL.iter().map(JobEventType::channel).collect();
        let mut messages = self.store.subscribe(&channels).await?;
        let callbacks = self.callbacks.clone();
        let store = self.store.clone();

        let handle = tokio::spawn(async move {
            loop {
                while let Some((channel, payload)) = messages.next().await {
                    dispatch(&callbacks, &channel, &payload);
                }
                warn!("Job event stream ended, resubscribing");
                messages = resubscribe(&store, &channels).await;
            }
        });

        *self.task.lock() = Some(handle);
        info!("Job event receiver started");
        Ok(())
    }

    /// Stops dispatching and drops every registered callback.
    ///
    /// Pending completions resolve to [`JobError::Cancelled`].
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Job event receiver stopped");
        }
        // Dropped outside the lock: callbacks own completion senders.
        let dropped = std::mem::take(&mut *self.callbacks.write());
        drop(dropped);
    }

    /// Registers `callback` for events of `kind`.
    pub fn subscribe_to<F>(&self, kind: JobEventType, callback: F) -> Subscription
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .entry(kind)
            .or_default()
            .insert(id, Arc::new(callback));
        Subscription {
            id,
            kind,
            callbacks: Arc::downgrade(&self.callbacks),
        }
    }

    pub fn on_enqueued<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.subscribe_to(JobEventType::Enqueued, callback)
    }

    pub fn on_dequeued<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.subscribe_to(JobEventType::Dequeued, callback)
    }

    pub fn on_retry<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.subscribe_to(JobEventType::Retry, callback)
    }

    pub fn on_complete<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.subscribe_to(JobEventType::Complete, callback)
    }

    pub fn on_failed<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.subscribe_to(JobEventType::Failed, callback)
    }

    /// Number of callbacks registered for `kind`.
    pub fn subscriber_count(&self, kind: JobEventType) -> usize {
        self.callbacks.read().get(&kind).map_or(0, HashMap::len)
    }
}

impl Drop for JobEventReceiver {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn resubscribe(
    store: &Arc<dyn Store>,
    channels: &[String],
) -> BoxStream<'static, (String, String)> {
    let mut backoff = RESUBSCRIBE_BACKOFF;
    loop {
        tokio::time::sleep(backoff).await;
        match store.subscribe(channels).await {
            Ok(messages) => {
                info!("Job event receiver resubscribed");
                return messages;
            }
            Err(e) => {
                error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Failed to resubscribe to job events");
                backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
            }
        }
    }
}

fn dispatch(callbacks: &CallbackMap, channel: &str, payload: &str) {
    let Some(kind) = channel
        .strip_prefix(EVENT_CHANNEL_PREFIX)
        .and_then(|raw| raw.parse::<JobEventType>().ok())
    else {
        warn!(channel = %channel, "Event on unknown channel");
        return;
    };

    let event: JobEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Failed to decode job event");
            return;
        }
    };

    let job = match Job::from_record(&event.job) {
        Ok(job) => job,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Failed to rehydrate job from event");
            return;
        }
    };

    // Callbacks may unsubscribe, so they run outside the lock.
    let targets: Vec<EventCallback> = callbacks
        .read()
        .get(&kind)
        .map(|registered| registered.values().cloned().collect())
        .unwrap_or_default();

    for callback in targets {
        callback(&job);
    }
}
