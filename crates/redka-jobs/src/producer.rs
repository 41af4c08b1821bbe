//! Job creation, completion tracking and record cleanup.

use crate::error::{JobError, JobResult};
use crate::events::{JobEventEmitter, JobEventReceiver, JobEventType, Subscription};
use crate::job::{EnqueueOptions, Job, JobId};
use crate::keys::{is_reserved, KeySpace};
use crate::store::Store;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Writes jobs and tracks their outcome.
#[derive(Clone)]
pub struct JobProducer {
    store: Arc<dyn Store>,
    keys: KeySpace,
    emitter: JobEventEmitter,
    receiver: Arc<JobEventReceiver>,
    drain_on_completion: bool,
}

impl JobProducer {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        emitter: JobEventEmitter,
        receiver: Arc<JobEventReceiver>,
        drain_on_completion: bool,
    ) -> Self {
        Self {
            store,
            keys,
            emitter,
            receiver,
            drain_on_completion,
        }
    }

    /// Builds a job for the user-facing `queue`.
    pub fn create(
        &self,
        queue: &str,
        name: &str,
        params: Value,
        options: &EnqueueOptions,
    ) -> JobResult<Job> {
        if queue.is_empty() {
            return Err(JobError::InvalidArgument("Queue name is required".to_string()));
        }
        if is_reserved(queue) {
            return Err(JobError::InvalidArgument(format!(
                "Queue name {queue} is reserved"
            )));
        }
        if name.is_empty() {
            return Err(JobError::InvalidArgument("Job name is required".to_string()));
        }
        Job::new(self.keys.queue(queue), name, params, options)
    }

    /// Enqueues a job without tracking its outcome.
    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        params: Value,
        options: EnqueueOptions,
    ) -> JobResult<JobId> {
        let job = self.create(queue, name, params, &options)?;
        self.write(&job).await?;
        Ok(job.id)
    }

    /// Enqueues a job and returns a future resolving to its outcome.
    ///
    /// The completion listeners are installed before the job is written, so
    /// the outcome cannot be missed. A write failure is returned here and the
    /// listeners are removed.
    pub async fn enqueue_and_wait(
        &self,
        queue: &str,
        name: &str,
        params: Value,
        options: EnqueueOptions,
    ) -> JobResult<Completion> {
        let job = self.create(queue, name, params, &options)?;
        let completion = self.track(&job.id);
        self.write(&job).await?;
        Ok(completion)
    }

    /// Deletes a finished job's record and its terminal list entries.
    pub async fn drain(&self, job: &Job) -> JobResult<()> {
        let id = job.id.as_str();
        self.store.delete(&self.keys.job(id)).await?;
        self.store.remove(&KeySpace::complete(&job.queue), id).await?;
        self.store.remove(&KeySpace::failed(&job.queue), id).await?;
        debug!(job_id = %id, "Drained job");
        Ok(())
    }

    async fn write(&self, job: &Job) -> JobResult<()> {
        let list = if job.is_delayed() {
            self.keys.delay()
        } else {
            KeySpace::pending(&job.queue)
        };

        self.store.register(&self.keys.queues(), &job.queue).await?;
        self.store
            .insert(job.id.as_str(), &self.keys.job(job.id.as_str()), &job.to_record(), &list)
            .await?;

        debug!(job_id = %job.id, queue = %job.queue, name = %job.name, delay = job.delay, "Enqueued job");
        self.emitter.job_enqueued(job).await;
        Ok(())
    }

    fn track(&self, job_id: &JobId) -> Completion {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let subscriptions: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        for kind in [JobEventType::Complete, JobEventType::Failed] {
            let tx = tx.clone();
            let registered = subscriptions.clone();
            let expected = job_id.clone();
            let producer = self.drain_on_completion.then(|| self.clone());

            let subscription = self.receiver.subscribe_to(kind, move |job: &Job| {
                if job.id != expected {
                    return;
                }
                let Some(tx) = tx.lock().take() else {
                    return;
                };
                for subscription in registered.lock().drain(..) {
                    subscription.unsubscribe();
                }

                let outcome = if kind == JobEventType::Complete {
                    Ok(job.result.clone().unwrap_or(Value::Null))
                } else {
                    Err(JobError::Handler {
                        message: job.error.clone().unwrap_or_default(),
                        stack: job.stack.clone(),
                    })
                };
                let _ = tx.send(outcome);

                if let Some(producer) = producer.clone() {
                    let job = job.clone();
                    tokio::spawn(async move {
                        if let Err(e) = producer.drain(&job).await {
                            warn!(job_id = %job.id, error = %e, "Failed to drain finished job");
                        }
                    });
                }
            });
            subscriptions.lock().push(subscription);
        }

        Completion {
            job_id: job_id.clone(),
            rx,
            subscriptions,
        }
    }
}

/// Outcome of a job enqueued with [`JobProducer::enqueue_and_wait`].
///
/// Resolves once, to the handler's result or to the failure it reported.
/// Dropping it stops tracking the job.
pub struct Completion {
    job_id: JobId,
    rx: oneshot::Receiver<JobResult<Value>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl Completion {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Future for Completion {
    type Output = JobResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Cancelled)))
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn producer(drain_on_completion: bool) -> (Arc<MemoryStore>, JobProducer, Arc<JobEventReceiver>) {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn Store> = memory.clone();
        let receiver = Arc::new(JobEventReceiver::new(store.clone()));
        receiver.start().await.unwrap();
        let producer = JobProducer::new(
            store.clone(),
            KeySpace::default(),
            JobEventEmitter::new(store),
            receiver.clone(),
            drain_on_completion,
        );
        (memory, producer, receiver)
    }

    #[tokio::test]
    async fn test_reserved_queue_names() {
        let (_, producer, _) = producer(false).await;
        for reserved in ["_global-delay", "_batcher"] {
            let err = producer
                .enqueue(reserved, "n", Value::Null, EnqueueOptions::default())
                .await
                .unwrap_err();
            assert!(err.is_validation());
        }
    }

    #[tokio::test]
    async fn test_enqueue_writes_pending_or_delay() {
        let (store, producer, _) = producer(false).await;
        let now = producer
            .enqueue("q", "n", json!(1), EnqueueOptions::default())
            .await
            .unwrap();
        let later = producer
            .enqueue("q", "n", json!(2), EnqueueOptions::delay_ms(60_000))
            .await
            .unwrap();

        assert_eq!(store.range("redka_q_pending").await.unwrap(), vec![now.to_string()]);
        assert_eq!(store.range("redka__global-delay").await.unwrap(), vec![later.to_string()]);
        assert_eq!(store.members("redka__queues").await.unwrap(), vec!["redka_q"]);
    }

    #[tokio::test]
    async fn test_completion_resolves_once_and_unsubscribes() {
        let (_, producer, receiver) = producer(false).await;
        let completion = producer
            .enqueue_and_wait("q", "n", json!(1), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(receiver.subscriber_count(JobEventType::Complete), 1);
        assert_eq!(receiver.subscriber_count(JobEventType::Failed), 1);

        let emitter = JobEventEmitter::new(producer.store.clone());
        let mut job = Job::new("redka_q", "n", json!(1), &EnqueueOptions::default()).unwrap();
        job.id = completion.job_id().clone();
        job.result = Some(json!("done"));
        emitter.job_complete(&job).await;
        job.error = Some("late".into());
        emitter.job_failed(&job).await;

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), completion)
            .await
            .unwrap();
        assert_eq!(outcome.unwrap(), json!("done"));
        assert_eq!(receiver.subscriber_count(JobEventType::Complete), 0);
        assert_eq!(receiver.subscriber_count(JobEventType::Failed), 0);
    }

    #[tokio::test]
    async fn test_dropped_completion_unsubscribes() {
        let (_, producer, receiver) = producer(false).await;
        let completion = producer
            .enqueue_and_wait("q", "n", json!(1), EnqueueOptions::default())
            .await
            .unwrap();
        drop(completion);
        assert_eq!(receiver.subscriber_count(JobEventType::Complete), 0);
    }

    #[tokio::test]
    async fn test_drain_removes_record_and_terminal_entry() {
        let (store, producer, _) = producer(false).await;
        let id = producer
            .enqueue("q", "n", json!(1), EnqueueOptions::default())
            .await
            .unwrap();
        store.push("redka_q_complete", id.as_str()).await.unwrap();
        let job = Job::from_record(&store.read(id.as_str()).await.unwrap().unwrap()).unwrap();

        producer.drain(&job).await.unwrap();
        assert!(store.read(id.as_str()).await.unwrap().is_none());
        assert!(store.range("redka_q_complete").await.unwrap().is_empty());
    }
}
