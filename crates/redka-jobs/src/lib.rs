//! Redka Jobs - Redis-backed distributed job queue
//!
//! Producers enqueue jobs by `(queue, name, params)`; workers on any host
//! claim them, run the handler registered for the job name and record the
//! outcome. Job state lives entirely in Redis, so producers and workers
//! coordinate only through the store.
//!
//! - Immediate and delayed jobs, handler-requested retries
//! - Per-job timeouts and heartbeats with stale-job recovery
//! - Batching of many small jobs into one, fanout of one job to many queues
//! - Lifecycle events over pub/sub, awaitable results for producers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Redka Jobs Architecture                      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  Producer ──enqueue──┬──────────────► <queue>_pending             │
//! │                      └─(delayed)────► _global-delay               │
//! │                                          │                        │
//! │  DelayedJobsManager ─────(due)───────────┘                        │
//! │         │                                                         │
//! │         └─(stale heartbeat)──► back to <queue>_pending            │
//! │                                                                   │
//! │  Worker ──claim──► <queue>_progress ──settle──► complete/failed   │
//! │     │                                    └──(retry)──► delay      │
//! │     └─ heartbeat, timeout                                         │
//! │                                                                   │
//! │  BatchProcessor: many source jobs ──► one target job              │
//! │                                                                   │
//! │  Events: redka-job-events:<TYPE> ──► JobEventReceiver callbacks   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use redka_jobs::prelude::*;
//! use serde_json::json;
//!
//! let redka = Redka::connect(JobsConfig::default()).await?;
//!
//! let worker = redka.worker("hello", redka.worker_options()).await?;
//! worker.register(Handlers::new().on("world", |params, _ctx| async move {
//!     Ok(json!(format!("hello {}", params.as_str().unwrap_or("world"))))
//! }));
//!
//! let greeting = redka
//!     .enqueue_and_wait("hello", "world", json!("bob"), EnqueueOptions::default())
//!     .await?
//!     .await?;
//! assert_eq!(greeting, json!("hello bob"));
//! ```

pub mod batch;
pub mod config;
pub mod context;
pub mod delay;
pub mod error;
pub mod events;
pub mod fanout;
pub mod handler;
pub mod job;
pub mod keys;
pub mod metrics;
pub mod multiplex;
pub mod producer;
pub mod redka;
pub mod reporter;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use batch::{BatchConfig, BatchProcessor};
pub use config::{BatcherConfig, DelayConfig, JobsConfig, RedisConfig, WorkerConfig};
pub use context::JobContext;
pub use delay::DelayedJobsManager;
pub use error::{JobError, JobResult};
pub use events::{JobEvent, JobEventEmitter, JobEventReceiver, JobEventType, Subscription};
pub use fanout::{fanout_handlers, Destination, FanoutConfig};
pub use handler::{Handler, HandlerFuture, Handlers};
pub use job::{Delay, EnqueueOptions, Job, JobId, JobRecord, JobStatus};
pub use keys::KeySpace;
pub use metrics::{register_metrics, JobMetrics, SchedulerMetrics};
pub use multiplex::WorkerMultiplex;
pub use producer::{Completion, JobProducer};
pub use redka::Redka;
pub use reporter::{ReportSink, ReportUpdate, Reporter, TracingSink};
pub use scheduler::SchedulerState;
pub use store::{MemoryStore, RedisStore, Store};
pub use worker::{Worker, WorkerOptions, WorkerState, WorkerStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::JobsConfig;
    pub use crate::handler::Handlers;
    pub use crate::job::{EnqueueOptions, Job, JobStatus};
    pub use crate::redka::Redka;
    pub use crate::worker::WorkerOptions;
    pub use crate::{JobContext, JobError, JobId, JobResult};
}
