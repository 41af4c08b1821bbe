//! Job queue configuration.

use crate::batch::BatchConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the job queue system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Defaults for workers created through the facade.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Delayed jobs manager configuration.
    #[serde(default)]
    pub delay: DelayConfig,

    /// Batch processor configuration.
    #[serde(default)]
    pub batcher: BatcherConfig,

    /// Push finished job ids onto the legacy `_complete` / `_failed` lists.
    #[serde(default = "default_keep_terminal_lists")]
    pub keep_terminal_lists: bool,

    /// Delete the job record once the enqueue caller has seen its outcome.
    #[serde(default)]
    pub drain_on_completion: bool,

    /// Batches registered at startup.
    #[serde(default)]
    pub batches: Vec<BatchConfig>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            worker: WorkerConfig::default(),
            delay: DelayConfig::default(),
            batcher: BatcherConfig::default(),
            keep_terminal_lists: default_keep_terminal_lists(),
            drain_on_completion: false,
            batches: Vec::new(),
        }
    }
}

fn default_keep_terminal_lists() -> bool {
    true
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Prefix prepended to queue names and shared keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "redka_".to_string()
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Per-job timeout in milliseconds; unset means no timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Number of concurrent members per queue.
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Back-off between dequeue attempts when another slot is already blocked.
    #[serde(default = "default_spinup")]
    pub spinup_ms: u64,

    /// Heartbeat refresh interval while a job is worked.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Blocking pop timeout.
    #[serde(default = "default_dequeue_timeout")]
    pub dequeue_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            parallel: default_parallel(),
            spinup_ms: default_spinup(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            dequeue_timeout_ms: default_dequeue_timeout(),
        }
    }
}

fn default_parallel() -> usize {
    1
}

fn default_spinup() -> u64 {
    500
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_dequeue_timeout() -> u64 {
    1000
}

impl WorkerConfig {
    /// Returns the job timeout as Duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Returns spinup as Duration.
    pub fn spinup(&self) -> Duration {
        Duration::from_millis(self.spinup_ms)
    }

    /// Returns heartbeat interval as Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Returns the blocking pop timeout as Duration.
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

/// Delayed jobs manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Run the delayed jobs manager inside this process.
    #[serde(default = "default_delay_enabled")]
    pub enabled: bool,

    /// Interval of both the promotion and the sweep loop.
    #[serde(default = "default_delay_poll_interval")]
    pub poll_interval_ms: u64,

    /// Age after which a heartbeat is considered lost.
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,

    /// Fail a reclaimed job once its attempt exceeds this value.
    #[serde(default)]
    pub max_stuck_attempts: Option<u32>,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            enabled: default_delay_enabled(),
            poll_interval_ms: default_delay_poll_interval(),
            stale_after_ms: default_stale_after(),
            max_stuck_attempts: None,
        }
    }
}

fn default_delay_enabled() -> bool {
    true
}

fn default_delay_poll_interval() -> u64 {
    100
}

fn default_stale_after() -> u64 {
    10_000
}

impl DelayConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Batch processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Interval of the batching loop.
    #[serde(default = "default_batcher_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_batcher_poll_interval(),
        }
    }
}

fn default_batcher_poll_interval() -> u64 {
    200
}

impl BatcherConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.redis.key_prefix, "redka_");
        assert_eq!(config.worker.parallel, 1);
        assert_eq!(config.worker.spinup(), Duration::from_millis(500));
        assert_eq!(config.worker.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.worker.dequeue_timeout(), Duration::from_secs(1));
        assert!(config.worker.timeout().is_none());
        assert!(config.delay.enabled);
        assert_eq!(config.delay.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.delay.stale_after_ms, 10_000);
        assert_eq!(config.batcher.poll_interval(), Duration::from_millis(200));
        assert!(config.keep_terminal_lists);
        assert!(!config.drain_on_completion);
        assert!(config.batches.is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: JobsConfig = serde_json::from_str(
            r#"{"worker": {"timeout_ms": 2000}, "delay": {"max_stuck_attempts": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.worker.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.worker.spinup_ms, 500);
        assert_eq!(config.delay.max_stuck_attempts, Some(3));
        assert_eq!(config.redis.url, "redis://localhost:6379");
    }

    #[test]
    fn test_batches_deserialize() {
        let config: JobsConfig = serde_json::from_str(
            r#"{"batches": [{"source_queue": "in", "source_name": "item", "target_queue": "out", "target_name": "items", "batch_size": 5}]}"#,
        )
        .unwrap();
        assert_eq!(config.batches.len(), 1);
        assert_eq!(config.batches[0].batch_size, 5);
        assert_eq!(config.batches[0].batch_interval_ms, 1000);
    }
}
