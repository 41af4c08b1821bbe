//! Redis store.

use super::{DrainBatch, Settle, Store, Sweep, SweepOutcome};
use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use crate::job::JobRecord;
use crate::keys::KeySpace;
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};

const STAMP: &str = include_str!("lua/stamp.lua");
const SETTLE: &str = include_str!("lua/settle.lua");
const PROMOTE: &str = include_str!("lua/promote.lua");
const SWEEP: &str = include_str!("lua/sweep.lua");
const BATCH: &str = include_str!("lua/batch.lua");

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job queue...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {e}")))?
        .max_size(config.pool_size)
        .create_timeout(Some(Duration::from_secs(config.connect_timeout_secs)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {e}")))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

struct Scripts {
    stamp: redis::Script,
    settle: redis::Script,
    promote: redis::Script,
    sweep: redis::Script,
    batch: redis::Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            stamp: redis::Script::new(STAMP),
            settle: redis::Script::new(SETTLE),
            promote: redis::Script::new(PROMOTE),
            sweep: redis::Script::new(SWEEP),
            batch: redis::Script::new(BATCH),
        }
    }
}

/// Redis-backed store.
///
/// Blocking claims hold a pooled connection for up to the claim timeout, so
/// the pool should be larger than the number of polling slots.
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    scripts: Scripts,
}

impl RedisStore {
    /// Create a store from an existing pool. `url` is used for pub/sub
    /// connections, which cannot be pooled.
    pub fn new(pool: Pool, url: &str) -> JobResult<Self> {
        Ok(Self {
            pool,
            client: redis::Client::open(url)?,
            scripts: Scripts::new(),
        })
    }

    /// Connect using the given configuration.
    pub async fn connect(config: &RedisConfig) -> JobResult<Self> {
        let pool = create_pool(config).await?;
        Self::new(pool, &config.url)
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn insert(&self, job_id: &str, job_key: &str, record: &JobRecord, list: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let fields: Vec<(&String, &String)> = record.iter().collect();

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(job_key, &fields)
            .ignore()
            .lpush(list, job_id)
            .ignore()
            .query_async(&mut *conn)
            .await?;

        debug!(job_id = %job_id, list = %list, "Inserted job");
        Ok(())
    }

    async fn update(&self, job_key: &str, fields: &JobRecord) -> JobResult<Option<JobRecord>> {
        if fields.is_empty() {
            return self.read(job_key).await;
        }

        let mut conn = self.conn().await?;
        let mut invocation = self.scripts.stamp.prepare_invoke();
        invocation.key(job_key);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let record: Option<JobRecord> = invocation.invoke_async(&mut *conn).await?;
        Ok(record)
    }

    async fn read(&self, job_key: &str) -> JobResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let record: JobRecord = conn.hgetall(job_key).await?;
        Ok(if record.is_empty() { None } else { Some(record) })
    }

    async fn delete(&self, job_key: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(job_key).await?;
        Ok(())
    }

    async fn push(&self, list: &str, value: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.lpush(list, value).await?;
        Ok(())
    }

    async fn range(&self, list: &str) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(list, 0, -1).await?)
    }

    async fn remove(&self, list: &str, value: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.lrem(list, 0, value).await?)
    }

    async fn claim(&self, from: &str, to: &str, timeout: Duration) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        let item: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(from)
            .arg(to)
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(item)
    }

    async fn register(&self, registry: &str, queue: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(registry, queue).await?;
        Ok(())
    }

    async fn members(&self, registry: &str) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(registry).await?)
    }

    async fn load_scripts(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        for source in [STAMP, SETTLE, PROMOTE, SWEEP, BATCH] {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async(&mut *conn)
                .await?;
            debug!(sha = %sha, "Loaded script");
        }
        Ok(())
    }

    async fn settle(&self, settle: &Settle) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = self.scripts.settle.prepare_invoke();
        invocation.key(&settle.progress).key(&settle.job_key);
        if let Some(target) = &settle.target {
            invocation.key(target);
        }
        invocation.arg(&settle.job_id).arg(settle.fields.len());
        for (field, value) in &settle.fields {
            invocation.arg(field).arg(value);
        }
        for field in &settle.clear {
            invocation.arg(field);
        }

        let settled: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(settled == 1)
    }

    async fn promote_delayed(&self, delay_list: &str, now_ms: i64) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let promoted: Vec<String> = self
            .scripts
            .promote
            .key(delay_list)
            .arg(now_ms)
            .invoke_async(&mut *conn)
            .await?;
        Ok(promoted)
    }

    async fn sweep_stale(&self, sweep: &Sweep) -> JobResult<SweepOutcome> {
        let mut conn = self.conn().await?;
        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .scripts
            .sweep
            .key(&sweep.registry)
            .arg(sweep.now_ms)
            .arg(sweep.stale_after_ms)
            .arg(sweep.max_stuck_attempts)
            .arg(&sweep.now_iso)
            .arg(if sweep.keep_terminal_lists { "1" } else { "0" })
            .invoke_async(&mut *conn)
            .await?;

        if !failed.is_empty() {
            warn!(count = failed.len(), "Failed jobs whose heartbeat was lost");
        }
        Ok(SweepOutcome { requeued, failed })
    }

    async fn drain_batch(&self, batch: &DrainBatch) -> JobResult<Option<Vec<String>>> {
        let mut conn = self.conn().await?;
        let drained: Option<Vec<String>> = self
            .scripts
            .batch
            .key(KeySpace::pending(&batch.source_queue))
            .key(&batch.clock_key)
            .key(KeySpace::pending(&batch.target_queue))
            .key(&batch.target_id)
            .key(&batch.registry)
            .key(KeySpace::complete(&batch.source_queue))
            .arg(&batch.source_name)
            .arg(&batch.target_queue)
            .arg(&batch.target_name)
            .arg(batch.interval_ms)
            .arg(batch.size)
            .arg(&batch.target_id)
            .arg(batch.now_ms)
            .arg(&batch.now_iso)
            .arg(if batch.keep_terminal_lists { "1" } else { "0" })
            .invoke_async(&mut *conn)
            .await?;
        Ok(drained)
    }

    async fn publish(&self, channel: &str, payload: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> JobResult<BoxStream<'static, (String, String)>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some((msg.get_channel_name().to_string(), payload)),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable event payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
