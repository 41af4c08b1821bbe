//! Entry point wiring the store, workers, schedulers and events together.

use crate::batch::{BatchConfig, BatchProcessor};
use crate::config::JobsConfig;
use crate::delay::DelayedJobsManager;
use crate::error::{JobError, JobResult};
use crate::events::{JobEventEmitter, JobEventReceiver, Subscription};
use crate::fanout::{fanout_handlers, FanoutConfig};
use crate::job::{EnqueueOptions, Job, JobId};
use crate::keys::{is_reserved, KeySpace};
use crate::multiplex::WorkerMultiplex;
use crate::producer::{Completion, JobProducer};
use crate::reporter::{ReportSink, Reporter};
use crate::store::{RedisStore, Store};
use crate::worker::{Worker, WorkerOptions};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A running job queue instance.
///
/// ```rust,ignore
/// let redka = Redka::connect(JobsConfig::default()).await?;
/// let worker = redka.worker("hello", redka.worker_options()).await?;
/// worker.register(Handlers::new().on("world", |params, _ctx| async move {
///     Ok(json!(format!("hello {params}")))
/// }));
/// let greeting = redka.enqueue_and_wait("hello", "world", json!("bob"), Default::default()).await?.await?;
/// ```
pub struct Redka {
    store: Arc<dyn Store>,
    keys: KeySpace,
    config: JobsConfig,
    receiver: Arc<JobEventReceiver>,
    emitter: JobEventEmitter,
    producer: JobProducer,
    batch_processor: BatchProcessor,
    delayed_jobs_manager: Option<DelayedJobsManager>,
    workers: RwLock<HashMap<String, WorkerMultiplex>>,
    reporters: Mutex<Vec<Reporter>>,
}

impl Redka {
    /// Connects to Redis using `config.redis` and starts the instance.
    pub async fn connect(config: JobsConfig) -> JobResult<Self> {
        let store = RedisStore::connect(&config.redis).await?;
        Self::new(Arc::new(store), config).await
    }

    /// Starts an instance on an existing store.
    ///
    /// Subscribes to job events, starts the batch processor and, unless
    /// disabled, the delayed jobs manager.
    pub async fn new(store: Arc<dyn Store>, config: JobsConfig) -> JobResult<Self> {
        let keys = KeySpace::new(config.redis.key_prefix.clone());
        let emitter = JobEventEmitter::new(store.clone());
        let receiver = Arc::new(JobEventReceiver::new(store.clone()));
        receiver.start().await?;

        let producer = JobProducer::new(
            store.clone(),
            keys.clone(),
            emitter.clone(),
            receiver.clone(),
            config.drain_on_completion,
        );

        let batch_processor = BatchProcessor::new(
            store.clone(),
            keys.clone(),
            emitter.clone(),
            config.batcher.poll_interval(),
            config.keep_terminal_lists,
        );
        for batch in &config.batches {
            batch_processor.add(batch.clone())?;
        }
        batch_processor.start().await?;

        let delayed_jobs_manager = if config.delay.enabled {
            let manager = DelayedJobsManager::new(
                store.clone(),
                keys.clone(),
                emitter.clone(),
                config.delay.clone(),
                config.keep_terminal_lists,
            );
            manager.start().await?;
            Some(manager)
        } else {
            None
        };

        info!(prefix = %keys.prefix(), delay = config.delay.enabled, "Redka started");

        Ok(Self {
            store,
            keys,
            config,
            receiver,
            emitter,
            producer,
            batch_processor,
            delayed_jobs_manager,
            workers: RwLock::new(HashMap::new()),
            reporters: Mutex::new(Vec::new()),
        })
    }

    /// Worker options derived from `config.worker`.
    pub fn worker_options(&self) -> WorkerOptions {
        let mut options = WorkerOptions::from(&self.config.worker);
        options.keep_terminal_lists = self.config.keep_terminal_lists;
        options
    }

    /// Creates the workers for `queue`: `options.parallel` independent
    /// workers with one slot each. Only one group per queue is allowed.
    ///
    /// Fails if the heartbeat interval exceeds half of `delay.stale_after_ms`.
    pub async fn worker(&self, queue: &str, options: WorkerOptions) -> JobResult<WorkerMultiplex> {
        if queue.is_empty() || is_reserved(queue) {
            return Err(JobError::InvalidArgument(format!(
                "Queue name {queue} is reserved or empty"
            )));
        }

        options.validate()?;
        // The sweep must never see a live job's heartbeat as stale.
        let stale_after = Duration::from_millis(self.config.delay.stale_after_ms);
        if options.heartbeat_interval * 2 > stale_after {
            return Err(JobError::Configuration(format!(
                "Heartbeat interval {}ms must be at most half of stale_after_ms {}",
                options.heartbeat_interval.as_millis(),
                self.config.delay.stale_after_ms
            )));
        }

        let fq = self.keys.queue(queue);
        let multiplex = {
            let mut workers = self.workers.write();
            if workers.contains_key(queue) {
                return Err(JobError::InvalidArgument(format!(
                    "Cannot create duplicate worker for queue {queue}"
                )));
            }

            let member_options = WorkerOptions {
                parallel: 1,
                ..options.clone()
            };
            let members = (0..options.parallel.max(1))
                .map(|_| {
                    Worker::new(
                        fq.clone(),
                        self.store.clone(),
                        self.keys.clone(),
                        self.emitter.clone(),
                        member_options.clone(),
                    )
                })
                .collect();
            let multiplex = WorkerMultiplex::new(fq.clone(), members);
            workers.insert(queue.to_string(), multiplex.clone());
            multiplex
        };

        if let Err(e) = self.store.register(&self.keys.queues(), &fq).await {
            self.workers.write().remove(queue);
            return Err(e);
        }
        info!(queue = %fq, parallel = multiplex.len(), "Created worker");
        Ok(multiplex)
    }

    /// Stops and forgets the workers of `queue`.
    pub async fn remove_worker(&self, queue: &str) -> bool {
        let removed = self.workers.write().remove(queue);
        match removed {
            Some(multiplex) => {
                multiplex.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn worker_for(&self, queue: &str) -> Option<WorkerMultiplex> {
        self.workers.read().get(queue).cloned()
    }

    /// Enqueues a job without tracking its outcome.
    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        params: Value,
        options: EnqueueOptions,
    ) -> JobResult<JobId> {
        self.producer.enqueue(queue, name, params, options).await
    }

    /// Enqueues a job; the returned [`Completion`] resolves to its outcome.
    pub async fn enqueue_and_wait(
        &self,
        queue: &str,
        name: &str,
        params: Value,
        options: EnqueueOptions,
    ) -> JobResult<Completion> {
        self.producer
            .enqueue_and_wait(queue, name, params, options)
            .await
    }

    /// Registers a batch definition.
    pub fn batch(&self, config: BatchConfig) -> JobResult<()> {
        self.batch_processor.add(config)
    }

    /// Creates workers on `source` whose handlers copy each job to its
    /// configured destinations.
    pub async fn fanout(
        &self,
        source: &str,
        config: &FanoutConfig,
        options: WorkerOptions,
    ) -> JobResult<WorkerMultiplex> {
        let multiplex = self.worker(source, options).await?;
        multiplex.register(fanout_handlers(self.producer.clone(), config));
        Ok(multiplex)
    }

    /// Deletes a finished job's record and terminal list entries.
    pub async fn drain(&self, job: &Job) -> JobResult<()> {
        self.producer.drain(job).await
    }

    /// Streams job events to `sink` until [`Redka::stop`].
    pub fn report_to(&self, sink: Arc<dyn ReportSink>) {
        let reporter = Reporter::start(&self.receiver, sink);
        self.reporters.lock().push(reporter);
    }

    pub fn on_enqueued<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.receiver.on_enqueued(callback)
    }

    pub fn on_dequeued<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.receiver.on_dequeued(callback)
    }

    pub fn on_retry<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.receiver.on_retry(callback)
    }

    pub fn on_complete<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.receiver.on_complete(callback)
    }

    pub fn on_failed<F: Fn(&Job) + Send + Sync + 'static>(&self, callback: F) -> Subscription {
        self.receiver.on_failed(callback)
    }

    /// Stops workers, then schedulers, reporters and the event receiver.
    pub async fn stop(&self) {
        let workers: Vec<WorkerMultiplex> = self.workers.write().drain().map(|(_, mx)| mx).collect();
        join_all(workers.iter().map(WorkerMultiplex::stop)).await;

        if let Some(manager) = &self.delayed_jobs_manager {
            manager.stop().await;
        }
        self.batch_processor.stop().await;

        let reporters: Vec<Reporter> = std::mem::take(&mut *self.reporters.lock());
        join_all(reporters.iter().map(Reporter::stop)).await;

        self.receiver.stop();
        info!("Redka stopped");
    }

    pub fn producer(&self) -> &JobProducer {
        &self.producer
    }

    pub fn receiver(&self) -> &Arc<JobEventReceiver> {
        &self.receiver
    }

    pub fn delayed_jobs_manager(&self) -> Option<&DelayedJobsManager> {
        self.delayed_jobs_manager.as_ref()
    }

    pub fn batch_processor(&self) -> &BatchProcessor {
        &self.batch_processor
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }
}
