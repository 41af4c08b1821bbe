//! Metrics for job queue monitoring.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Metric names for the job queue system.
pub mod names {
    /// Total jobs enqueued (including promoted and batched jobs).
    pub const JOBS_ENQUEUED_TOTAL: &str = "redka_jobs_enqueued_total";
    /// Total jobs dequeued for processing.
    pub const JOBS_DEQUEUED_TOTAL: &str = "redka_jobs_dequeued_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "redka_jobs_completed_total";
    /// Total jobs failed.
    pub const JOBS_FAILED_TOTAL: &str = "redka_jobs_failed_total";
    /// Total jobs retried.
    pub const JOBS_RETRIED_TOTAL: &str = "redka_jobs_retried_total";
    /// Total jobs timed out.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "redka_jobs_timed_out_total";

    /// Total delayed jobs promoted to their pending list.
    pub const DELAYED_PROMOTED_TOTAL: &str = "redka_delayed_promoted_total";
    /// Total jobs reclaimed by the heartbeat sweep.
    pub const STUCK_RECLAIMED_TOTAL: &str = "redka_stuck_reclaimed_total";
    /// Total batches emitted.
    pub const BATCHES_EMITTED_TOTAL: &str = "redka_batches_emitted_total";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "redka_job_duration_seconds";
    /// Number of source jobs folded into each emitted batch.
    pub const BATCH_SIZE: &str = "redka_batch_size";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_DEQUEUED_TOTAL,
        "Total number of jobs dequeued for processing"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of job retries");
    describe_counter!(
        names::JOBS_TIMED_OUT_TOTAL,
        "Total number of jobs that timed out"
    );
    describe_counter!(
        names::DELAYED_PROMOTED_TOTAL,
        "Total number of delayed jobs moved to a pending list"
    );
    describe_counter!(
        names::STUCK_RECLAIMED_TOTAL,
        "Total number of jobs reclaimed after losing their heartbeat"
    );
    describe_counter!(names::BATCHES_EMITTED_TOTAL, "Total number of batches emitted");
    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );
    describe_histogram!(
        names::BATCH_SIZE,
        "Number of source jobs folded into each batch"
    );
}

/// Job lifecycle metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job dequeued.
    pub fn job_dequeued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_DEQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job failed.
    pub fn job_failed(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job retried.
    pub fn job_retried(queue: &str, job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a job timeout.
    pub fn job_timed_out(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record how long a handler ran and how it ended.
    pub fn job_duration(queue: &str, job_name: &str, outcome: &'static str, duration: Duration) {
        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }
}

/// Background scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record promoted delayed jobs.
    pub fn promoted(count: usize) {
        counter!(names::DELAYED_PROMOTED_TOTAL).increment(count as u64);
    }

    /// Record jobs reclaimed by the heartbeat sweep.
    pub fn reclaimed(count: usize) {
        counter!(names::STUCK_RECLAIMED_TOTAL).increment(count as u64);
    }

    /// Record an emitted batch.
    pub fn batch_emitted(target_queue: &str, size: usize) {
        counter!(names::BATCHES_EMITTED_TOTAL, "queue" => target_queue.to_string()).increment(1);
        histogram!(names::BATCH_SIZE, "queue" => target_queue.to_string()).record(size as f64);
    }
}
