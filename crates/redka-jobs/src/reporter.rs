//! Streams job lifecycle updates to an external sink.

use crate::error::JobResult;
use crate::events::{JobEventReceiver, JobEventType, Subscription};
use crate::job::{iso, Job};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Partial document describing one job transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportUpdate {
    pub job_id: String,
    pub event: JobEventType,
    pub fields: Map<String, Value>,
}

impl ReportUpdate {
    /// Projects `job` onto the fields that change with `kind`.
    pub fn project(kind: JobEventType, job: &Job) -> Self {
        let mut fields = Map::new();
        let status = || Value::from(job.status.map(|s| s.as_str()));
        let notes = || escape(&Value::Object(job.notes.clone()));
        let at = |at: Option<chrono::DateTime<chrono::Utc>>| Value::from(at.map(iso));

        match kind {
            JobEventType::Enqueued => {
                fields.insert("queue".into(), Value::from(job.queue.clone()));
                fields.insert("name".into(), Value::from(job.name.clone()));
                fields.insert("params".into(), escape(&job.params));
                fields.insert("delay".into(), Value::from(job.delay));
                fields.insert("attempt".into(), Value::from(job.attempt));
                fields.insert("notes".into(), notes());
                fields.insert("enqueued".into(), Value::from(iso(job.enqueued)));
            }
            JobEventType::Dequeued => {
                fields.insert("status".into(), status());
                fields.insert("dequeued".into(), at(job.dequeued));
            }
            JobEventType::Retry => {
                fields.insert("status".into(), status());
                fields.insert("attempt".into(), Value::from(job.attempt));
                fields.insert("notes".into(), notes());
            }
            JobEventType::Complete => {
                fields.insert("status".into(), status());
                fields.insert("complete".into(), at(job.complete));
                fields.insert(
                    "result".into(),
                    job.result.as_ref().map_or(Value::Null, escape),
                );
                fields.insert("notes".into(), notes());
            }
            JobEventType::Failed => {
                fields.insert("status".into(), status());
                fields.insert("failed".into(), at(job.failed));
                fields.insert("error".into(), Value::from(job.error.clone()));
                fields.insert("stack".into(), Value::from(job.stack.clone()));
                fields.insert("notes".into(), notes());
            }
        }
        fields.insert("wasOnceStuck".into(), Value::from(job.was_once_stuck));

        Self {
            job_id: job.id.to_string(),
            event: kind,
            fields,
        }
    }
}

/// Escapes a key for document stores that reserve `.` and a leading `$`.
pub fn escape_key(key: &str) -> String {
    let escaped = key.replace('.', "->");
    match escaped.strip_prefix('$') {
        Some(rest) => format!("_{rest}"),
        None => escaped,
    }
}

fn escape(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (escape_key(key), escape(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(escape).collect()),
        other => other.clone(),
    }
}

/// Destination for report updates.
#[async_trait]
pub trait ReportSink: Send + Sync + 'static {
    async fn write(&self, update: ReportUpdate) -> JobResult<()>;
}

/// Sink that logs every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ReportSink for TracingSink {
    async fn write(&self, update: ReportUpdate) -> JobResult<()> {
        info!(
            job_id = %update.job_id,
            event = update.event.as_str(),
            fields = %serde_json::Value::Object(update.fields),
            "Job report"
        );
        Ok(())
    }
}

/// Feeds every job event to a [`ReportSink`], one write at a time.
pub struct Reporter {
    subscriptions: Mutex<Vec<Subscription>>,
    tx: Mutex<Option<mpsc::UnboundedSender<ReportUpdate>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Reporter {
    /// Subscribes to every event type on `receiver`.
    pub fn start(receiver: &JobEventReceiver, sink: Arc<dyn ReportSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ReportUpdate>();

        let writer = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let job_id = update.job_id.clone();
                if let Err(e) = sink.write(update).await {
                    warn!(job_id = %job_id, error = %e, "Failed to write job report");
                }
            }
            debug!("Report writer finished");
        });

        let subscriptions = JobEventType::ALL
            .iter()
            .map(|&kind| {
                let tx = tx.clone();
                receiver.subscribe_to(kind, move |job| {
                    let _ = tx.send(ReportUpdate::project(kind, job));
                })
            })
            .collect();

        Self {
            subscriptions: Mutex::new(subscriptions),
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Unsubscribes and waits until queued updates are written.
    pub async fn stop(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        self.tx.lock().take();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "Report writer ended abnormally");
            }
        }
    }
}
