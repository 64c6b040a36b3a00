mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use jobqueue_core::{
    Backend, Database, PermanentError, PlainQueue, PoolConfig, Service, ServiceConfig, WorkerConfig,
    WorkerPool,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

async fn service_over(dir: &tempfile::TempDir, queue: &str) -> Service {
    let path = dir.path().join("queue.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let config = ServiceConfig {
        pool: PoolConfig::new(url),
        queue_name: queue.to_string(),
        max_workers: 1,
        worker: WorkerConfig {
            poll_interval_millis: 10,
            ..WorkerConfig::default()
        },
        dedup: None,
    };
    Service::new(config).await.unwrap()
}

async fn wait_until<F: Fn() -> bool>(f: F) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn handler_runs_and_job_is_deleted_on_success() {
    let dir = tempdir().unwrap();
    let service = service_over(&dir, "q").await;

    let seen: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let seen_clone = Arc::clone(&seen);
    service
        .register("echo", move |_body| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    service.start().await.unwrap();
    service.enqueue("echo", b"hello", None, Duration::zero()).await.unwrap();

    wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
    service.stop().await.unwrap();
}

#[tokio::test]
async fn permanent_error_skips_retries_and_fires_on_failure_once() {
    let dir = tempdir().unwrap();
    let service = service_over(&dir, "q").await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));

    let attempts_clone = Arc::clone(&attempts);
    service
        .register_with(
            "always-fails",
            move |_body| {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Box::new(PermanentError::message("nope")) as Box<dyn std::error::Error + Send + Sync>)
                }
            },
            jobqueue_core::HandlerOptions::new().with_on_failure({
                let failures = Arc::clone(&failures);
                Arc::new(move |_job, _err| {
                    failures.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .unwrap();

    service.start().await.unwrap();
    service
        .enqueue("always-fails", b"x", None, Duration::zero())
        .await
        .unwrap();

    wait_until(|| failures.load(Ordering::SeqCst) == 1).await;
    // Give any erroneous retry a moment to happen before asserting it didn't.
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    service.stop().await.unwrap();
}

#[tokio::test]
async fn starting_twice_fails() {
    let dir = tempdir().unwrap();
    let service = service_over(&dir, "q").await;
    service.start().await.unwrap();
    assert!(service.start().await.is_err());
    service.stop().await.unwrap();
}

#[tokio::test]
async fn enqueue_after_stop_fails_fast() {
    let dir = tempdir().unwrap();
    let service = service_over(&dir, "q").await;
    service.start().await.unwrap();
    service.stop().await.unwrap();
    assert!(service.enqueue("echo", b"x", None, Duration::zero()).await.is_err());
}

#[tokio::test]
async fn unregistered_task_name_panics_the_claim_loop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let db = Database::connect(&PoolConfig::new(url)).await.unwrap();
    db.setup().await.unwrap();

    let queue = PlainQueue::new(db, "q", 5);
    queue.setup().await.unwrap();
    queue
        .send(
            &jobqueue_core::Envelope::new("nobody-home", b"x", None).encode(),
            Duration::zero(),
        )
        .await
        .unwrap();

    let pool = WorkerPool::new(
        Backend::Plain(queue),
        WorkerConfig {
            poll_interval_millis: 10,
            ..WorkerConfig::default()
        },
    );

    let cancel = CancellationToken::new();
    let result = tokio::spawn(async move { pool.start(cancel).await }).await;
    assert!(result.unwrap_err().is_panic());
}

#[tokio::test]
async fn invalid_envelope_body_is_dead_lettered_without_a_handler_call() {
    let dir = tempdir().unwrap();
    let service = service_over(&dir, "q").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    service
        .register("echo", move |_body| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    // Bypass the envelope encoder to enqueue a raw, non-enveloped payload
    // directly against the same database the service is polling.
    let path = dir.path().join("queue.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool_config = PoolConfig::new(url);
    let db = jobqueue_core::Database::connect(&pool_config).await.unwrap();
    db.setup().await.unwrap();
    let raw_queue = jobqueue_core::PlainQueue::new(db, "q", 5);
    raw_queue.send(b"not an envelope", Duration::zero()).await.unwrap();

    service.start().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    service.stop().await.unwrap();
}
