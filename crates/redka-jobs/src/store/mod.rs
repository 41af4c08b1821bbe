//! Storage abstraction.
//!
//! A [`Store`] offers the list, hash and set primitives the queue needs, a
//! blocking pop-and-move, pub/sub, and a handful of multi-step procedures
//! that must run atomically. [`RedisStore`] runs those procedures as Lua
//! scripts; [`MemoryStore`] runs them under a single lock.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{create_pool, RedisStore};

use crate::error::JobResult;
use crate::job::JobRecord;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Atomic settle of a claimed job.
///
/// The id is removed from `progress`; only if it was there are `fields`
/// written, `clear` fields deleted and the id pushed onto `target`.
#[derive(Debug, Clone)]
pub struct Settle {
    pub progress: String,
    pub job_key: String,
    pub job_id: String,
    pub fields: JobRecord,
    pub clear: Vec<String>,
    pub target: Option<String>,
}

/// Parameters of the stale-heartbeat sweep.
#[derive(Debug, Clone)]
pub struct Sweep {
    /// Set of fully-qualified queue names.
    pub registry: String,
    pub now_ms: i64,
    pub now_iso: String,
    pub stale_after_ms: u64,
    /// 0 means reclaimed jobs are never failed.
    pub max_stuck_attempts: u32,
    pub keep_terminal_lists: bool,
}

/// Ids touched by a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

/// Parameters of one batching pass.
#[derive(Debug, Clone)]
pub struct DrainBatch {
    pub source_queue: String,
    pub source_name: String,
    pub clock_key: String,
    pub target_queue: String,
    pub target_name: String,
    pub target_id: String,
    pub registry: String,
    pub interval_ms: u64,
    pub size: usize,
    pub now_ms: i64,
    pub now_iso: String,
    pub keep_terminal_lists: bool,
}

/// Backing store for queues, job records and events.
///
/// Lists behave like Redis lists: `push` adds at the head and `claim`
/// takes from the tail, so lists are FIFO.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Writes a new record and pushes its id onto `list` in one step.
    async fn insert(&self, job_id: &str, job_key: &str, record: &JobRecord, list: &str) -> JobResult<()>;

    /// Writes `fields` if the record exists and returns the full record.
    async fn update(&self, job_key: &str, fields: &JobRecord) -> JobResult<Option<JobRecord>>;

    /// Reads a record.
    async fn read(&self, job_key: &str) -> JobResult<Option<JobRecord>>;

    /// Deletes a record.
    async fn delete(&self, job_key: &str) -> JobResult<()>;

    /// Pushes a value onto the head of a list.
    async fn push(&self, list: &str, value: &str) -> JobResult<()>;

    /// Returns a whole list, head first.
    async fn range(&self, list: &str) -> JobResult<Vec<String>>;

    /// Removes every occurrence of `value`, returning how many were removed.
    async fn remove(&self, list: &str, value: &str) -> JobResult<u64>;

    /// Moves the tail of `from` onto the head of `to`, waiting up to
    /// `timeout` for an item to appear.
    async fn claim(&self, from: &str, to: &str, timeout: Duration) -> JobResult<Option<String>>;

    /// Adds a queue to a registry set.
    async fn register(&self, registry: &str, queue: &str) -> JobResult<()>;

    /// Members of a registry set.
    async fn members(&self, registry: &str) -> JobResult<Vec<String>>;

    /// Loads the atomic procedures ahead of their first use.
    async fn load_scripts(&self) -> JobResult<()>;

    /// Settles a claimed job. Returns false if another actor got there first.
    async fn settle(&self, settle: &Settle) -> JobResult<bool>;

    /// Moves due ids from `delay_list` to their queue's pending list and
    /// returns them. Ids without a record are dropped.
    async fn promote_delayed(&self, delay_list: &str, now_ms: i64) -> JobResult<Vec<String>>;

    /// Reclaims jobs whose worker stopped sending heartbeats.
    async fn sweep_stale(&self, sweep: &Sweep) -> JobResult<SweepOutcome>;

    /// Emits a batch when a threshold is met. Returns the drained source ids.
    async fn drain_batch(&self, batch: &DrainBatch) -> JobResult<Option<Vec<String>>>;

    /// Publishes a message.
    async fn publish(&self, channel: &str, payload: &str) -> JobResult<()>;

    /// Subscribes to channels; yields `(channel, payload)` pairs.
    async fn subscribe(&self, channels: &[String]) -> JobResult<BoxStream<'static, (String, String)>>;
}
