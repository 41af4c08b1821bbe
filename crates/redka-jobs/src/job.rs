//! Job value object and its flat record encoding.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Flat field map a job is stored as (one hash per job id).
pub type JobRecord = BTreeMap<String, String>;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job status. Advisory only; storage does not enforce transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a pending or delay list.
    Pending,
    /// Claimed by a worker.
    Dequeued,
    /// Rescheduled by its handler.
    Retry,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Dequeued => "dequeued",
            JobStatus::Retry => "retry",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns true for complete and failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "dequeued" => Ok(JobStatus::Dequeued),
            "retry" => Ok(JobStatus::Retry),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobError::InvalidArgument(format!("Unknown job status: {other}"))),
        }
    }
}

/// When a job should become eligible for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Absolute point in time.
    At(DateTime<Utc>),
    /// Milliseconds from now; must not be negative.
    In(i64),
}

/// Options accepted when creating a job.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Optional delay before the job is promoted to its pending list.
    pub delay: Option<Delay>,
}

impl EnqueueOptions {
    /// Delay the job by `ms` milliseconds.
    pub fn delay_ms(ms: i64) -> Self {
        Self {
            delay: Some(Delay::In(ms)),
        }
    }

    /// Run the job at `at`.
    pub fn run_at(at: DateTime<Utc>) -> Self {
        Self {
            delay: Some(Delay::At(at)),
        }
    }
}

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// RFC 3339 timestamp with millisecond precision, as stored on records.
pub fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One unit of work and its lifecycle metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// Fully-qualified queue name (prefix included).
    pub queue: String,
    pub name: String,
    pub params: Value,
    pub enqueued: DateTime<Utc>,
    pub dequeued: Option<DateTime<Utc>>,
    pub complete: Option<DateTime<Utc>>,
    pub failed: Option<DateTime<Utc>>,
    /// Absolute execution time in epoch ms; 0 means immediate.
    pub delay: i64,
    pub attempt: u32,
    pub status: Option<JobStatus>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub stack: Option<String>,
    pub notes: Map<String, Value>,
    /// Last liveness signal in epoch ms.
    pub heartbeat: Option<i64>,
    pub was_once_stuck: bool,
}

impl Job {
    /// Creates a fresh job for `queue`.
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        params: Value,
        options: &EnqueueOptions,
    ) -> JobResult<Self> {
        let mut job = Self {
            id: JobId::new(),
            queue: queue.into(),
            name: name.into(),
            params,
            enqueued: Utc::now(),
            dequeued: None,
            complete: None,
            failed: None,
            delay: 0,
            attempt: 1,
            status: Some(JobStatus::Pending),
            result: None,
            error: None,
            stack: None,
            notes: Map::new(),
            heartbeat: None,
            was_once_stuck: false,
        };
        job.apply_delay(options.delay)?;
        Ok(job)
    }

    fn apply_delay(&mut self, delay: Option<Delay>) -> JobResult<()> {
        match delay {
            None => {}
            Some(Delay::At(at)) => self.delay = at.timestamp_millis(),
            Some(Delay::In(ms)) => {
                if ms < 0 {
                    return Err(JobError::InvalidArgument(
                        "Delay must be greater than zero".to_string(),
                    ));
                }
                if ms > 0 {
                    self.delay = now_ms() + ms;
                }
            }
        }
        Ok(())
    }

    /// Returns true if the job must wait on the delay list.
    pub fn is_delayed(&self) -> bool {
        self.delay != 0
    }

    /// Reschedules the job `delay_ms` from now.
    pub fn retry(&mut self, delay_ms: u64) {
        self.delay = now_ms() + i64::try_from(delay_ms).unwrap_or(i64::MAX / 2);
        self.status = Some(JobStatus::Retry);
    }

    /// Writes a note visible to later attempts and reporters.
    pub fn note(&mut self, key: impl Into<String>, val: Value) {
        self.notes.insert(key.into(), val);
    }

    /// Reads a note.
    pub fn look(&self, key: &str) -> Option<&Value> {
        self.notes.get(key)
    }

    /// Encodes the job as a flat record.
    pub fn to_record(&self) -> JobRecord {
        let mut record = JobRecord::new();
        record.insert("id".into(), self.id.to_string());
        record.insert("queue".into(), self.queue.clone());
        record.insert("name".into(), self.name.clone());
        record.insert("params".into(), self.params.to_string());
        record.insert("enqueued".into(), iso(self.enqueued));
        record.insert("delay".into(), self.delay.to_string());
        record.insert("attempt".into(), self.attempt.to_string());
        record.insert("notes".into(), Value::Object(self.notes.clone()).to_string());
        if let Some(status) = self.status {
            record.insert("status".into(), status.to_string());
        }
        if let Some(at) = self.dequeued {
            record.insert("dequeued".into(), iso(at));
        }
        if let Some(at) = self.complete {
            record.insert("complete".into(), iso(at));
        }
        if let Some(at) = self.failed {
            record.insert("failed".into(), iso(at));
        }
        if let Some(result) = &self.result {
            record.insert("result".into(), result.to_string());
        }
        if let Some(error) = &self.error {
            record.insert("error".into(), error.clone());
        }
        if let Some(stack) = &self.stack {
            record.insert("stack".into(), stack.clone());
        }
        if let Some(heartbeat) = self.heartbeat {
            record.insert("heartbeat".into(), heartbeat.to_string());
        }
        if self.was_once_stuck {
            record.insert("wasOnceStuck".into(), "true".into());
        }
        record
    }

    /// Rebuilds a job from a stored record.
    pub fn from_record(record: &JobRecord) -> JobResult<Self> {
        let required = |field: &str| {
            record
                .get(field)
                .cloned()
                .ok_or_else(|| JobError::InvalidArgument(format!("Job record is missing '{field}'")))
        };

        let notes = match record.get("notes").map(|raw| try_parse(raw)) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Ok(Self {
            id: JobId::from_string(required("id")?),
            queue: required("queue")?,
            name: required("name")?,
            params: record.get("params").map(|raw| try_parse(raw)).unwrap_or(Value::Null),
            enqueued: record
                .get("enqueued")
                .and_then(|raw| parse_time(raw))
                .unwrap_or_else(Utc::now),
            dequeued: record.get("dequeued").and_then(|raw| parse_time(raw)),
            complete: record.get("complete").and_then(|raw| parse_time(raw)),
            failed: record.get("failed").and_then(|raw| parse_time(raw)),
            delay: record
                .get("delay")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            attempt: record
                .get("attempt")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(1)
                .max(1),
            status: record.get("status").and_then(|raw| raw.parse().ok()),
            result: record
                .get("result")
                .filter(|raw| !raw.is_empty())
                .map(|raw| try_parse(raw)),
            error: record
                .get("error")
                .filter(|raw| !raw.is_empty())
                .map(|raw| error_message(raw)),
            stack: record.get("stack").filter(|raw| !raw.is_empty()).cloned(),
            notes,
            heartbeat: record.get("heartbeat").and_then(|raw| raw.parse().ok()),
            was_once_stuck: record
                .get("wasOnceStuck")
                .is_some_and(|raw| raw == "true" || raw == "1"),
        })
    }
}

/// JSON-decodes `raw`, keeping it as a plain string when it is not JSON.
fn try_parse(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Error fields may hold a bare message, a JSON string, or an object with a message.
fn error_message(raw: &str) -> String {
    match try_parse(raw) {
        Value::String(message) => message,
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| raw.to_string(), ToString::to_string),
        _ => raw.to_string(),
    }
}

/// Accepts RFC 3339 strings and epoch milliseconds.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
