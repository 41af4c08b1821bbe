//! In-process store.

use super::{DrainBatch, Settle, Store, Sweep, SweepOutcome};
use crate::error::JobResult;
use crate::job::JobRecord;
use crate::keys::KeySpace;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

/// Channel capacity for pub/sub messages.
const PUBSUB_CAPACITY: usize = 1024;

#[derive(Default)]
struct Data {
    hashes: HashMap<String, JobRecord>,
    /// Front is the head.
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    strings: HashMap<String, String>,
}

impl Data {
    fn lpush(&mut self, list: &str, value: &str) {
        self.lists
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_string());
    }

    fn rpush(&mut self, list: &str, value: &str) {
        self.lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
    }

    fn lrem(&mut self, list: &str, value: &str) -> u64 {
        let Some(items) = self.lists.get_mut(list) else {
            return 0;
        };
        let before = items.len();
        items.retain(|item| item != value);
        let removed = (before - items.len()) as u64;
        if items.is_empty() {
            self.lists.remove(list);
        }
        removed
    }

    /// Ids of a list, tail (oldest) first.
    fn oldest_first(&self, list: &str) -> Vec<String> {
        self.lists
            .get(list)
            .map(|items| items.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn field(&self, key: &str, field: &str) -> Option<&String> {
        self.hashes.get(key).and_then(|record| record.get(field))
    }

    fn hset(&mut self, key: &str, field: &str, value: impl Into<String>) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    fn hdel(&mut self, key: &str, field: &str) {
        if let Some(record) = self.hashes.get_mut(key) {
            record.remove(field);
            if record.is_empty() {
                self.hashes.remove(key);
            }
        }
    }
}

/// Store keeping every structure in process memory.
///
/// Each procedure runs under one lock, which gives it the same atomicity a
/// Lua script has on Redis. Pub/sub only reaches subscribers of the same
/// instance.
pub struct MemoryStore {
    data: Mutex<Data>,
    pushed: Notify,
    events: Mutex<broadcast::Sender<(String, String)>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            data: Mutex::new(Data::default()),
            pushed: Notify::new(),
            events: Mutex::new(events),
        }
    }

    /// Ends every open subscription stream, as a dropped pub/sub
    /// connection does. Later subscriptions work normally.
    pub fn drop_subscribers(&self) {
        let (events, _) = broadcast::channel(PUBSUB_CAPACITY);
        let previous = std::mem::replace(&mut *self.events.lock(), events);
        drop(previous);
    }

    fn try_claim(&self, from: &str, to: &str) -> Option<String> {
        let mut data = self.data.lock();
        let item = data.lists.get_mut(from)?.pop_back()?;
        if data.lists.get(from).is_some_and(VecDeque::is_empty) {
            data.lists.remove(from);
        }
        data.lpush(to, &item);
        Some(item)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, job_id: &str, job_key: &str, record: &JobRecord, list: &str) -> JobResult<()> {
        {
            let mut data = self.data.lock();
            data.hashes
                .entry(job_key.to_string())
                .or_default()
                .extend(record.iter().map(|(k, v)| (k.clone(), v.clone())));
            data.lpush(list, job_id);
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn update(&self, job_key: &str, fields: &JobRecord) -> JobResult<Option<JobRecord>> {
        let mut data = self.data.lock();
        let Some(record) = data.hashes.get_mut(job_key) else {
            return Ok(None);
        };
        record.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(Some(record.clone()))
    }

    async fn read(&self, job_key: &str) -> JobResult<Option<JobRecord>> {
        Ok(self.data.lock().hashes.get(job_key).cloned())
    }

    async fn delete(&self, job_key: &str) -> JobResult<()> {
        self.data.lock().hashes.remove(job_key);
        Ok(())
    }

    async fn push(&self, list: &str, value: &str) -> JobResult<()> {
        self.data.lock().lpush(list, value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn range(&self, list: &str) -> JobResult<Vec<String>> {
        Ok(self
            .data
            .lock()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, list: &str, value: &str) -> JobResult<u64> {
        Ok(self.data.lock().lrem(list, value))
    }

    async fn claim(&self, from: &str, to: &str, timeout: Duration) -> JobResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_claim(from, to) {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn register(&self, registry: &str, queue: &str) -> JobResult<()> {
        self.data
            .lock()
            .sets
            .entry(registry.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn members(&self, registry: &str) -> JobResult<Vec<String>> {
        Ok(self
            .data
            .lock()
            .sets
            .get(registry)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn load_scripts(&self) -> JobResult<()> {
        Ok(())
    }

    async fn settle(&self, settle: &Settle) -> JobResult<bool> {
        {
            let mut data = self.data.lock();
            if data.lrem(&settle.progress, &settle.job_id) == 0 {
                return Ok(false);
            }
            for (field, value) in &settle.fields {
                data.hset(&settle.job_key, field, value.clone());
            }
            for field in &settle.clear {
                data.hdel(&settle.job_key, field);
            }
            if let Some(target) = &settle.target {
                data.lpush(target, &settle.job_id);
            }
        }
        if settle.target.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(true)
    }

    async fn promote_delayed(&self, delay_list: &str, now_ms: i64) -> JobResult<Vec<String>> {
        let mut promoted = Vec::new();
        {
            let mut data = self.data.lock();
            for id in data.oldest_first(delay_list) {
                let Some(queue) = data.field(&id, "queue").cloned() else {
                    data.lrem(delay_list, &id);
                    continue;
                };
                let due = data
                    .field(&id, "delay")
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(0);
                if due <= now_ms {
                    data.lrem(delay_list, &id);
                    data.lpush(&KeySpace::pending(&queue), &id);
                    promoted.push(id);
                }
            }
        }
        if !promoted.is_empty() {
            self.pushed.notify_waiters();
        }
        Ok(promoted)
    }

    async fn sweep_stale(&self, sweep: &Sweep) -> JobResult<SweepOutcome> {
        let mut outcome = SweepOutcome::default();
        {
            let mut data = self.data.lock();
            let queues: Vec<String> = data
                .sets
                .get(&sweep.registry)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();

            for queue in queues {
                let progress = KeySpace::progress(&queue);
                for id in data.oldest_first(&progress) {
                    if !data.hashes.contains_key(&id) {
                        data.lrem(&progress, &id);
                        continue;
                    }
                    let beat = data
                        .field(&id, "heartbeat")
                        .and_then(|raw| raw.parse::<i64>().ok());
                    let Some(beat) = beat else {
                        data.hset(&id, "heartbeat", sweep.now_ms.to_string());
                        continue;
                    };
                    if sweep.now_ms - beat <= i64::try_from(sweep.stale_after_ms).unwrap_or(i64::MAX) {
                        continue;
                    }

                    let attempt = data
                        .field(&id, "attempt")
                        .and_then(|raw| raw.parse::<u32>().ok())
                        .unwrap_or(1)
                        + 1;
                    data.lrem(&progress, &id);
                    data.hdel(&id, "heartbeat");
                    data.hset(&id, "attempt", attempt.to_string());
                    data.hset(&id, "wasOnceStuck", "true");

                    if sweep.max_stuck_attempts > 0 && attempt > sweep.max_stuck_attempts {
                        data.hset(&id, "status", "failed");
                        data.hset(&id, "failed", sweep.now_iso.clone());
                        data.hset(&id, "error", "Job heartbeat lost");
                        data.hset(&id, "stack", "");
                        if sweep.keep_terminal_lists {
                            data.lpush(&KeySpace::failed(&queue), &id);
                        }
                        outcome.failed.push(id);
                    } else {
                        data.hset(&id, "status", "pending");
                        data.rpush(&KeySpace::pending(&queue), &id);
                        outcome.requeued.push(id);
                    }
                }
            }
        }
        if !outcome.requeued.is_empty() {
            self.pushed.notify_waiters();
        }
        Ok(outcome)
    }

    async fn drain_batch(&self, batch: &DrainBatch) -> JobResult<Option<Vec<String>>> {
        let drained = {
            let mut data = self.data.lock();
            let source_pending = KeySpace::pending(&batch.source_queue);
            let matching: Vec<String> = data
                .oldest_first(&source_pending)
                .into_iter()
                .filter(|id| data.field(id, "name") == Some(&batch.source_name))
                .collect();

            if matching.is_empty() {
                data.strings.remove(&batch.clock_key);
                return Ok(None);
            }

            let first_seen = match data
                .strings
                .get(&batch.clock_key)
                .and_then(|raw| raw.parse::<i64>().ok())
            {
                Some(first_seen) => first_seen,
                None => {
                    data.strings
                        .insert(batch.clock_key.clone(), batch.now_ms.to_string());
                    batch.now_ms
                }
            };

            let waited = batch.now_ms - first_seen;
            if matching.len() < batch.size && waited < i64::try_from(batch.interval_ms).unwrap_or(i64::MAX) {
                return Ok(None);
            }

            let take = matching.len().min(batch.size);
            let result = Value::String(batch.target_id.clone()).to_string();
            let mut params = Vec::with_capacity(take);
            for id in &matching[..take] {
                data.lrem(&source_pending, id);
                params.push(
                    data.field(id, "params")
                        .cloned()
                        .unwrap_or_else(|| "null".to_string()),
                );
                data.hset(id, "status", "complete");
                data.hset(id, "complete", batch.now_iso.clone());
                data.hset(id, "result", result.clone());
                data.hdel(id, "heartbeat");
                if batch.keep_terminal_lists {
                    data.lpush(&KeySpace::complete(&batch.source_queue), id);
                }
            }

            let target = [
                ("id", batch.target_id.clone()),
                ("queue", batch.target_queue.clone()),
                ("name", batch.target_name.clone()),
                ("params", format!("[{}]", params.join(","))),
                ("enqueued", batch.now_iso.clone()),
                ("delay", "0".to_string()),
                ("attempt", "1".to_string()),
                ("status", "pending".to_string()),
                ("notes", "{}".to_string()),
            ];
            for (field, value) in target {
                data.hset(&batch.target_id, field, value);
            }
            data.lpush(&KeySpace::pending(&batch.target_queue), &batch.target_id);
            data.sets
                .entry(batch.registry.clone())
                .or_default()
                .insert(batch.target_queue.clone());

            if matching.len() > take {
                data.strings
                    .insert(batch.clock_key.clone(), batch.now_ms.to_string());
            } else {
                data.strings.remove(&batch.clock_key);
            }

            matching[..take].to_vec()
        };
        self.pushed.notify_waiters();
        Ok(Some(drained))
    }

    async fn publish(&self, channel: &str, payload: &str) -> JobResult<()> {
        // No receivers is not an error, same as PUBLISH reaching nobody.
        let _ = self.events.lock().send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> JobResult<BoxStream<'static, (String, String)>> {
        let channels: BTreeSet<String> = channels.iter().cloned().collect();
        let rx = self.events.lock().subscribe();

        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |(channel, _)| std::future::ready(channels.contains(channel)));

        Ok(messages.boxed())
    }
}
