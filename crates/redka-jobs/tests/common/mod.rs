//! Shared setup for the queue integration tests.

#![allow(dead_code)]

use redka_jobs::{Completion, JobResult, JobsConfig, MemoryStore, Redka, RedisConfig, RedisStore, Store};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::{Redis, REDIS_PORT};

/// Short intervals so the background loops react quickly.
pub fn test_config() -> JobsConfig {
    let mut config = JobsConfig::default();
    config.worker.dequeue_timeout_ms = 100;
    config.worker.heartbeat_interval_ms = 100;
    config.worker.spinup_ms = 20;
    config.delay.poll_interval_ms = 50;
    config.batcher.poll_interval_ms = 50;
    config
}

/// Starts an instance on a fresh in-memory store.
pub async fn memory_redka(config: JobsConfig) -> (Arc<MemoryStore>, Redka) {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn Store> = memory.clone();
    let redka = Redka::new(store, config)
        .await
        .expect("Failed to start redka");
    (memory, redka)
}

/// Awaits a completion, failing the test if it takes longer than `secs`.
pub async fn finish(completion: Completion, secs: u64) -> JobResult<Value> {
    tokio::time::timeout(Duration::from_secs(secs), completion)
        .await
        .expect("Job did not finish in time")
}

/// Redis testcontainer with a connected store.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    config: RedisConfig,
}

impl TestRedis {
    /// Starts a fresh Redis container.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{port}"),
            ..RedisConfig::default()
        };

        Self {
            _container: container,
            config,
        }
    }

    pub fn config(&self) -> RedisConfig {
        self.config.clone()
    }

    /// Connects a new store to the container.
    pub async fn store(&self) -> Arc<dyn Store> {
        let store = RedisStore::connect(&self.config)
            .await
            .expect("Failed to connect to Redis");
        Arc::new(store)
    }
}
