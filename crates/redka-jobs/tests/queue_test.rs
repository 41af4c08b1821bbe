//! End-to-end queue behavior against the in-memory store.

mod common;

use common::{finish, memory_redka, test_config};
use parking_lot::Mutex;
use redka_jobs::prelude::*;
use redka_jobs::{BatchConfig, Destination, FanoutConfig, Job, Store};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_hello_world() {
    let (_, redka) = memory_redka(test_config()).await;
    let worker = redka.worker("hello", redka.worker_options()).await.unwrap();
    worker.register(Handlers::new().on("world", |params, _ctx| async move {
        Ok(json!(format!("hello {}", params.as_str().unwrap_or_default())))
    }));

    let completion = redka
        .enqueue_and_wait("hello", "world", json!("bob"), EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(finish(completion, 5).await.unwrap(), json!("hello bob"));

    redka.stop().await;
    assert!(worker.is_stopped());
}

#[tokio::test]
async fn test_handler_error_rejects_caller() {
    let (_, redka) = memory_redka(test_config()).await;
    let worker = redka.worker("errors", redka.worker_options()).await.unwrap();
    worker.register(Handlers::new().on("boom", |_params, _ctx| async move {
        Err::<Value, _>(anyhow::anyhow!("ERR"))
    }));

    let completion = redka
        .enqueue_and_wait("errors", "boom", Value::Null, EnqueueOptions::default())
        .await
        .unwrap();
    match finish(completion, 5).await {
        Err(JobError::Handler { message, .. }) => assert_eq!(message, "ERR"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    redka.stop().await;
}

#[tokio::test]
async fn test_retry_until_fourth_attempt() {
    let (_, redka) = memory_redka(test_config()).await;
    let worker = redka.worker("retries", redka.worker_options()).await.unwrap();
    worker.register(Handlers::new().on("again", |_params, ctx: JobContext| async move {
        if ctx.attempt() < 4 {
            ctx.retry_in(400)?;
            return Ok(Value::Null);
        }
        Ok::<_, anyhow::Error>(json!(ctx.attempt()))
    }));

    let retries = Arc::new(AtomicUsize::new(0));
    let counter = retries.clone();
    let _subscription = redka.on_retry(move |_job| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let started = Instant::now();
    let completion = redka
        .enqueue_and_wait("retries", "again", Value::Null, EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(finish(completion, 10).await.unwrap(), json!(4));
    assert!(started.elapsed() >= Duration::from_millis(1200));
    assert_eq!(retries.load(Ordering::SeqCst), 3);

    redka.stop().await;
}

#[tokio::test]
async fn test_delayed_job_waits() {
    let (store, redka) = memory_redka(test_config()).await;
    let worker = redka.worker("later", redka.worker_options()).await.unwrap();
    worker.register(Handlers::new().on("tick", |_params, _ctx| async move { Ok(json!("ok")) }));

    let started = Instant::now();
    let completion = redka
        .enqueue_and_wait("later", "tick", Value::Null, EnqueueOptions::delay_ms(1000))
        .await
        .unwrap();
    assert_eq!(
        store.range(&redka.keys().delay()).await.unwrap(),
        vec![completion.job_id().to_string()]
    );

    assert_eq!(finish(completion, 5).await.unwrap(), json!("ok"));
    assert!(started.elapsed() >= Duration::from_millis(1000));

    redka.stop().await;
}

#[tokio::test]
async fn test_negative_delay_is_rejected() {
    let (_, redka) = memory_redka(test_config()).await;
    let err = redka
        .enqueue("q", "n", Value::Null, EnqueueOptions::delay_ms(-5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Delay must be greater than zero"));
    redka.stop().await;
}

#[tokio::test]
async fn test_stale_job_is_reclaimed() {
    let (store, redka) = memory_redka(test_config()).await;

    let mut job = Job::new(
        redka.keys().queue("stuck"),
        "work",
        json!(1),
        &EnqueueOptions::default(),
    )
    .unwrap();
    job.heartbeat = Some(chrono::Utc::now().timestamp_millis() - 60_000);
    store
        .insert(
            job.id.as_str(),
            &redka.keys().job(job.id.as_str()),
            &job.to_record(),
            &format!("{}_progress", job.queue),
        )
        .await
        .unwrap();
    store
        .register(&redka.keys().queues(), &job.queue)
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<Job>();
    let tx = Mutex::new(Some(tx));
    let _subscription = redka.on_complete(move |job| {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(job.clone());
        }
    });

    let worker = redka.worker("stuck", redka.worker_options()).await.unwrap();
    worker.register(Handlers::new().on("work", |_params, _ctx| async move { Ok(json!("recovered")) }));

    let completed = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.id, job.id);
    assert!(completed.was_once_stuck);
    assert_eq!(completed.attempt, 2);
    assert_eq!(completed.result, Some(json!("recovered")));

    redka.stop().await;
}

#[tokio::test]
async fn test_batch_of_five() {
    let mut config = test_config();
    config.batches.push(
        BatchConfig::new("items", "item", "bulk", "items", 5).with_interval(Duration::from_secs(60)),
    );
    let (_, redka) = memory_redka(config).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let worker = redka.worker("bulk", redka.worker_options()).await.unwrap();
    worker.register(Handlers::new().on("items", move |params, _ctx| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(params.clone());
            Ok(json!(params.as_array().map_or(0, Vec::len)))
        }
    }));

    let mut completions = Vec::new();
    for i in 0..5 {
        completions.push(
            redka
                .enqueue_and_wait("items", "item", json!(i), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let mut batch_ids = Vec::new();
    for completion in completions {
        batch_ids.push(finish(completion, 5).await.unwrap());
    }
    batch_ids.dedup();
    assert_eq!(batch_ids.len(), 1);

    let params = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(params, json!([0, 1, 2, 3, 4]));

    redka.stop().await;
}

#[tokio::test]
async fn test_fanout_copies_to_every_destination() {
    let (_, redka) = memory_redka(test_config()).await;

    let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    for (queue, name) in [("left", "copy-left"), ("right", "copy-right")] {
        let seen = seen.clone();
        let worker = redka.worker(queue, redka.worker_options()).await.unwrap();
        worker.register(Handlers::new().on(name, move |params, _ctx| {
            let seen = seen.clone();
            async move {
                seen.lock().push((queue.to_string(), params));
                Ok(Value::Null)
            }
        }));
    }

    let mut config = FanoutConfig::new();
    config.insert(
        "event".to_string(),
        vec![
            Destination::new("left", "copy-left"),
            Destination::new("right", "copy-right"),
        ],
    );
    redka
        .fanout("source", &config, redka.worker_options())
        .await
        .unwrap();

    let completion = redka
        .enqueue_and_wait("source", "event", json!({"n": 7}), EnqueueOptions::default())
        .await
        .unwrap();
    let copies = finish(completion, 5).await.unwrap();
    assert_eq!(copies.as_array().map(Vec::len), Some(2));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut seen = seen.lock().clone();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        seen,
        vec![
            ("left".to_string(), json!({"n": 7})),
            ("right".to_string(), json!({"n": 7})),
        ]
    );

    redka.stop().await;
}

#[tokio::test]
async fn test_multiplex_runs_jobs_in_parallel() {
    let (_, redka) = memory_redka(test_config()).await;
    let options = WorkerOptions {
        parallel: 3,
        ..redka.worker_options()
    };
    let worker = redka.worker("wide", options).await.unwrap();
    assert_eq!(worker.len(), 3);
    worker.register(Handlers::new().on("slow", |params, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(params)
    }));

    let started = Instant::now();
    let mut completions = Vec::new();
    for i in 0..3 {
        completions.push(
            redka
                .enqueue_and_wait("wide", "slow", json!(i), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }
    for completion in completions {
        finish(completion, 5).await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(1100));

    redka.stop().await;
}

#[tokio::test]
async fn test_timeout_fails_job() {
    let (_, redka) = memory_redka(test_config()).await;
    let options = WorkerOptions {
        timeout: Some(Duration::from_millis(100)),
        ..redka.worker_options()
    };
    let worker = redka.worker("slow", options).await.unwrap();
    worker.register(Handlers::new().on("hang", |_params, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(json!("too late"))
    }));

    let completion = redka
        .enqueue_and_wait("slow", "hang", Value::Null, EnqueueOptions::default())
        .await
        .unwrap();
    let err = finish(completion, 5).await.unwrap_err();
    assert_eq!(err.to_string(), "Worker timed out");

    redka.stop().await;
}

#[tokio::test]
async fn test_missing_handler_fails_job() {
    let (_, redka) = memory_redka(test_config()).await;
    let worker = redka.worker("partial", redka.worker_options()).await.unwrap();
    worker.register(Handlers::new().on("known", |_params, _ctx| async move { Ok(Value::Null) }));

    let completion = redka
        .enqueue_and_wait("partial", "unknown", Value::Null, EnqueueOptions::default())
        .await
        .unwrap();
    let err = finish(completion, 5).await.unwrap_err();
    assert!(err.to_string().contains("No callback registered"));

    redka.stop().await;
}

#[tokio::test]
async fn test_each_job_runs_exactly_once() {
    let (_, redka) = memory_redka(test_config()).await;
    let options = WorkerOptions {
        parallel: 4,
        ..redka.worker_options()
    };
    let worker = redka.worker("many", options).await.unwrap();

    let runs: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let counter = runs.clone();
    worker.register(Handlers::new().on("count", move |_params, ctx: JobContext| {
        let counter = counter.clone();
        async move {
            *counter.lock().entry(ctx.job_id().to_string()).or_default() += 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Value::Null)
        }
    }));

    let mut completions = Vec::new();
    for i in 0..20 {
        completions.push(
            redka
                .enqueue_and_wait("many", "count", json!(i), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }
    for completion in completions {
        finish(completion, 10).await.unwrap();
    }

    let runs = runs.lock();
    assert_eq!(runs.len(), 20);
    assert!(runs.values().all(|&count| count == 1));
    drop(runs);

    redka.stop().await;
}

#[tokio::test]
async fn test_reserved_queue_names_are_rejected() {
    let (_, redka) = memory_redka(test_config()).await;
    assert!(redka
        .enqueue("_global-delay", "n", Value::Null, EnqueueOptions::default())
        .await
        .is_err());
    assert!(redka
        .worker("_batcher", redka.worker_options())
        .await
        .is_err());
    redka.stop().await;
}

#[tokio::test]
async fn test_duplicate_worker_is_rejected() {
    let (_, redka) = memory_redka(test_config()).await;
    redka.worker("solo", redka.worker_options()).await.unwrap();
    let err = redka
        .worker("solo", redka.worker_options())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Cannot create duplicate worker"));

    assert!(redka.remove_worker("solo").await);
    assert!(redka.worker("solo", redka.worker_options()).await.is_ok());
    redka.stop().await;
}

#[tokio::test]
async fn test_drain_on_completion_deletes_record() {
    let mut config = test_config();
    config.drain_on_completion = true;
    let (store, redka) = memory_redka(config).await;
    let worker = redka.worker("tidy", redka.worker_options()).await.unwrap();
    worker.register(Handlers::new().on("job", |_params, _ctx| async move { Ok(json!(1)) }));

    let completion = redka
        .enqueue_and_wait("tidy", "job", Value::Null, EnqueueOptions::default())
        .await
        .unwrap();
    let id = completion.job_id().clone();
    assert_eq!(finish(completion, 5).await.unwrap(), json!(1));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.read(&redka.keys().job(id.as_str())).await.unwrap().is_none());
    assert!(store.range("redka_tidy_complete").await.unwrap().is_empty());

    redka.stop().await;
}

#[tokio::test]
async fn test_pending_completion_is_cancelled_by_stop() {
    let (_, redka) = memory_redka(test_config()).await;
    let completion = redka
        .enqueue_and_wait("unworked", "job", Value::Null, EnqueueOptions::default())
        .await
        .unwrap();

    redka.stop().await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), completion)
        .await
        .unwrap();
    assert!(matches!(outcome, Err(JobError::Cancelled)));
}

#[tokio::test]
async fn test_worker_options_are_validated() {
    let (_, redka) = memory_redka(test_config()).await;

    let zero_timeout = WorkerOptions {
        timeout: Some(Duration::ZERO),
        ..redka.worker_options()
    };
    let err = redka.worker("strict", zero_timeout).await.unwrap_err();
    assert!(err.is_validation());

    // Default stale_after_ms is 10s, so a 6s heartbeat would be reclaimed.
    let slow_heartbeat = WorkerOptions {
        heartbeat_interval: Duration::from_secs(6),
        ..redka.worker_options()
    };
    let err = redka.worker("strict", slow_heartbeat).await.unwrap_err();
    assert!(err.to_string().contains("stale_after_ms"));

    assert!(redka.worker_for("strict").is_none());
    assert!(redka.worker("strict", redka.worker_options()).await.is_ok());
    redka.stop().await;
}
