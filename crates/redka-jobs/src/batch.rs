//! Accumulates jobs of one name into batch jobs on another queue.

use crate::error::{JobError, JobResult};
use crate::events::{JobEventEmitter, JobEventType};
use crate::job::{iso, JobId};
use crate::keys::KeySpace;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::{SchedulerControl, SchedulerState};
use crate::store::{DrainBatch, Store};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One batch definition. Queue names are given without the key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub source_queue: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub target_queue: String,
    #[serde(default)]
    pub target_name: String,
    /// Emit once this many source jobs are waiting.
    #[serde(default)]
    pub batch_size: usize,
    /// Emit whatever is waiting once the oldest item waited this long.
    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,
}

fn default_batch_interval() -> u64 {
    1000
}

impl BatchConfig {
    pub fn new(
        source_queue: impl Into<String>,
        source_name: impl Into<String>,
        target_queue: impl Into<String>,
        target_name: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            source_queue: source_queue.into(),
            source_name: source_name.into(),
            target_queue: target_queue.into(),
            target_name: target_name.into(),
            batch_size,
            batch_interval_ms: default_batch_interval(),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.batch_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Checks that every field is set.
    pub fn validate(&self) -> JobResult<()> {
        let required = [
            ("source_queue", &self.source_queue),
            ("source_name", &self.source_name),
            ("target_queue", &self.target_queue),
            ("target_name", &self.target_name),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(JobError::InvalidArgument(format!("{field} option is required")));
        }
        if self.batch_size == 0 {
            return Err(JobError::InvalidArgument(
                "batch_size option must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Periodically turns waiting source jobs into batch jobs.
///
/// Drained source jobs are marked complete with the batch job id as their
/// result; the batch job's params are the drained params in enqueue order.
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<BatchInner>,
}

struct BatchInner {
    store: Arc<dyn Store>,
    keys: KeySpace,
    emitter: JobEventEmitter,
    poll_interval: Duration,
    keep_terminal_lists: bool,
    batches: RwLock<Vec<BatchConfig>>,
    control: Arc<SchedulerControl>,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        emitter: JobEventEmitter,
        poll_interval: Duration,
        keep_terminal_lists: bool,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                store,
                keys,
                emitter,
                poll_interval,
                keep_terminal_lists,
                batches: RwLock::new(Vec::new()),
                control: SchedulerControl::new("batch-processor"),
            }),
        }
    }

    /// Adds a batch definition; takes effect on the next pass.
    pub fn add(&self, config: BatchConfig) -> JobResult<()> {
        config.validate()?;
        info!(
            source_queue = %config.source_queue,
            source_name = %config.source_name,
            target_queue = %config.target_queue,
            batch_size = config.batch_size,
            batch_interval_ms = config.batch_interval_ms,
            "Registered batch"
        );
        self.inner.batches.write().push(config);
        Ok(())
    }

    pub fn batches(&self) -> Vec<BatchConfig> {
        self.inner.batches.read().clone()
    }

    /// Loads the batching script and starts the loop.
    pub async fn start(&self) -> JobResult<()> {
        self.inner.control.begin()?;
        if let Err(e) = self.inner.store.load_scripts().await {
            self.inner.control.fail("load-scripts", &e);
            return Err(e);
        }

        let inner = self.inner.clone();
        self.inner
            .control
            .spawn_loop("batch", self.inner.poll_interval, move || {
                let inner = inner.clone();
                async move { inner.run().await.map(|_| ()) }
            });
        Ok(())
    }

    /// Stops after the in-flight pass.
    pub async fn stop(&self) {
        self.inner.control.stop().await;
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.control.state()
    }

    /// Resolves once the processor halts: with its error, or with
    /// [`JobError::Cancelled`] after `stop`.
    pub async fn fatal(&self) -> JobError {
        self.inner.control.fatal().await
    }

    /// Runs one pass over every batch; returns the number of batches emitted.
    pub async fn run_once(&self) -> JobResult<usize> {
        self.inner.run().await
    }
}

impl BatchInner {
    async fn run(&self) -> JobResult<usize> {
        let batches = self.batches.read().clone();
        let mut emitted = 0;
        for batch in &batches {
            if self.drain(batch).await? {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    async fn drain(&self, config: &BatchConfig) -> JobResult<bool> {
        let source_queue = self.keys.queue(&config.source_queue);
        let target_queue = self.keys.queue(&config.target_queue);
        let target_id = JobId::new().to_string();
        let now = Utc::now();

        let request = DrainBatch {
            clock_key: self.keys.batcher(&source_queue, &config.source_name),
            source_queue,
            source_name: config.source_name.clone(),
            target_queue,
            target_name: config.target_name.clone(),
            target_id: target_id.clone(),
            registry: self.keys.queues(),
            interval_ms: config.batch_interval_ms,
            size: config.batch_size,
            now_ms: now.timestamp_millis(),
            now_iso: iso(now),
            keep_terminal_lists: self.keep_terminal_lists,
        };

        let Some(drained) = self.store.drain_batch(&request).await? else {
            return Ok(false);
        };

        info!(
            job_id = %target_id,
            queue = %request.target_queue,
            size = drained.len(),
            "Emitted batch"
        );
        SchedulerMetrics::batch_emitted(&request.target_queue, drained.len());

        self.emitter
            .emit_stored(JobEventType::Enqueued, &self.keys.job(&target_id))
            .await;
        for id in &drained {
            debug!(job_id = %id, batch_id = %target_id, "Batched job");
            self.emitter
                .emit_stored(JobEventType::Complete, &self.keys.job(id))
                .await;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EnqueueOptions, Job};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn processor(store: &Arc<MemoryStore>) -> BatchProcessor {
        let store: Arc<dyn Store> = store.clone();
        BatchProcessor::new(
            store.clone(),
            KeySpace::default(),
            JobEventEmitter::new(store),
            Duration::from_millis(20),
            false,
        )
    }

    #[test]
    fn test_validation_names_missing_field() {
        let err = BatchConfig::new("", "item", "out", "items", 5)
            .validate()
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid argument: source_queue option is required");

        let err = BatchConfig::new("in", "item", "out", "", 5)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("target_name"));

        let err = BatchConfig::new("in", "item", "out", "items", 0)
            .validate()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_default_interval() {
        let config = BatchConfig::new("in", "item", "out", "items", 5);
        assert_eq!(config.batch_interval_ms, 1000);
        let config = config.with_interval(Duration::from_millis(250));
        assert_eq!(config.batch_interval_ms, 250);
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_config() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&store);
        assert!(processor.add(BatchConfig::new("in", "", "out", "items", 5)).is_err());
        assert!(processor.batches().is_empty());
    }

    #[tokio::test]
    async fn test_run_once_emits_full_batch() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&store);
        processor
            .add(BatchConfig::new("in", "item", "out", "items", 2).with_interval(Duration::from_secs(60)))
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..2 {
            let job = Job::new("redka_in", "item", json!(i), &EnqueueOptions::default()).unwrap();
            store
                .insert(job.id.as_str(), job.id.as_str(), &job.to_record(), "redka_in_pending")
                .await
                .unwrap();
            ids.push(job.id);
        }

        assert_eq!(processor.run_once().await.unwrap(), 1);
        let targets = store.range("redka_out_pending").await.unwrap();
        assert_eq!(targets.len(), 1);
        let target = Job::from_record(&store.read(&targets[0]).await.unwrap().unwrap()).unwrap();
        assert_eq!(target.name, "items");
        assert_eq!(target.params, json!([0, 1]));

        let source = Job::from_record(&store.read(ids[0].as_str()).await.unwrap().unwrap()).unwrap();
        assert_eq!(source.result, Some(json!(target.id.to_string())));
        assert_eq!(processor.run_once().await.unwrap(), 0);
    }
}
