//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The job handler reported a failure.
    ///
    /// Displays as the bare handler message so that producers see exactly
    /// what the handler reported.
    #[error("{message}")]
    Handler {
        /// Failure message.
        message: String,
        /// Failure detail (error chain) if available.
        stack: Option<String>,
    },

    /// No handler registered for the job name.
    #[error("No callback registered for job {queue} {name}")]
    NoHandler { queue: String, name: String },

    /// The worker-level timeout fired before the handler resolved.
    #[error("Worker timed out")]
    WorkerTimedOut,

    /// A job was resolved more than once.
    #[error("Job callback is called twice: {0}")]
    DoubleResolution(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Generic store error (non-Redis stores).
    #[error("Store error: {0}")]
    Store(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Scheduler error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// The completion channel was dropped before an outcome arrived.
    #[error("Job completion was cancelled")]
    Cancelled,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Builds a handler failure from an `anyhow` error returned by a handler.
    pub fn handler(err: &anyhow::Error) -> Self {
        JobError::Handler {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        }
    }

    /// Returns true if this error came from talking to the store.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            JobError::Redis(_) | JobError::Pool(_) | JobError::Store(_)
        )
    }

    /// Returns true if this error is a caller mistake detected up front.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            JobError::InvalidArgument(_) | JobError::Configuration(_)
        )
    }

    /// Stack text recorded on a failed job.
    pub fn stack(&self) -> String {
        match self {
            JobError::Handler { stack: Some(stack), .. } => stack.clone(),
            other => format!("{other:?}"),
        }
    }
}
