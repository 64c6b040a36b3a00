mod common;

use std::time::Duration as StdDuration;

use jobqueue_core::{DeadLetterReason, DedupConfig, DedupQueue, Envelope};
use tokio_util::sync::CancellationToken;

fn envelope_bytes(task: &str, message: &[u8]) -> Vec<u8> {
    Envelope::new(task, message, None).encode()
}

#[tokio::test]
async fn identical_payload_is_suppressed_after_completion() {
    let test_db = common::setup_db().await;
    let queue = DedupQueue::new(
        test_db.db.clone(),
        "q",
        5,
        DedupConfig::default(),
        jobqueue_core::sha256_hasher(),
    );
    queue.setup().await.unwrap();

    let body = envelope_bytes("task-a", b"payload");
    let id = queue.send(&body).await.unwrap().expect("first send succeeds");

    let job = queue.receive(30).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    queue.delete(&job.id).await.unwrap();

    // Same payload, same task -- already completed, should be suppressed.
    assert!(queue.send(&body).await.unwrap().is_none());
}

#[tokio::test]
async fn dedup_disabled_allows_repeat_sends() {
    let test_db = common::setup_db().await;
    let config = DedupConfig {
        dedupe_enabled: false,
        block_repeats_on_dlq: true,
    };
    let queue = DedupQueue::new(test_db.db.clone(), "q", 5, config, jobqueue_core::sha256_hasher());
    queue.setup().await.unwrap();

    let body = envelope_bytes("task-a", b"payload");
    let first = queue.send(&body).await.unwrap();
    assert!(first.is_some());
    let job = queue.receive(30).await.unwrap().unwrap();
    queue.delete(&job.id).await.unwrap();

    // Dedup is off, so an identical payload is accepted again.
    let second = queue.send(&body).await.unwrap();
    assert!(second.is_some());
}

#[tokio::test]
async fn dead_lettered_payload_is_blocked_when_configured() {
    let test_db = common::setup_db().await;
    let queue = DedupQueue::new(
        test_db.db.clone(),
        "q",
        5,
        DedupConfig::default(),
        jobqueue_core::sha256_hasher(),
    );
    queue.setup().await.unwrap();

    let body = envelope_bytes("task-a", b"payload");
    queue.send(&body).await.unwrap();
    let job = queue.receive(30).await.unwrap().unwrap();
    queue
        .move_to_dead_letter(&job.id, DeadLetterReason::MaxRetries, "boom")
        .await
        .unwrap();

    assert!(queue.send(&body).await.unwrap().is_none());
}

#[tokio::test]
async fn dead_lettered_payload_is_allowed_again_when_block_repeats_is_off() {
    let test_db = common::setup_db().await;
    let config = DedupConfig {
        dedupe_enabled: true,
        block_repeats_on_dlq: false,
    };
    let queue = DedupQueue::new(test_db.db.clone(), "q", 5, config, jobqueue_core::sha256_hasher());
    queue.setup().await.unwrap();

    let body = envelope_bytes("task-a", b"payload");
    queue.send(&body).await.unwrap();
    let job = queue.receive(30).await.unwrap().unwrap();
    queue
        .move_to_dead_letter(&job.id, DeadLetterReason::MaxRetries, "boom")
        .await
        .unwrap();

    assert!(queue.send(&body).await.unwrap().is_some());
}

#[tokio::test]
async fn in_flight_duplicate_is_suppressed_even_with_dedup_policy_disabled() {
    // `jobs.UNIQUE(ns_id, key)` is unconditional: even with the job_done
    // consultation/write disabled, a second send of the same in-flight
    // payload must be silently dropped, not surfaced as a unique-constraint
    // query error.
    let test_db = common::setup_db().await;
    let config = DedupConfig {
        dedupe_enabled: false,
        block_repeats_on_dlq: true,
    };
    let queue = DedupQueue::new(test_db.db.clone(), "q", 5, config, jobqueue_core::sha256_hasher());
    queue.setup().await.unwrap();

    let body = envelope_bytes("task-a", b"payload");
    let first = queue.send(&body).await.unwrap();
    assert!(first.is_some());

    let second = queue.send(&body).await.unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn receive_and_wait_picks_up_a_job_sent_after_the_poll_starts() {
    let test_db = common::setup_db().await;
    let queue = DedupQueue::new(
        test_db.db.clone(),
        "q",
        5,
        DedupConfig::default(),
        jobqueue_core::sha256_hasher(),
    );
    queue.setup().await.unwrap();
    let cancel = CancellationToken::new();

    let waiter = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            queue.receive_and_wait(30, StdDuration::from_millis(10), &cancel).await
        })
    };

    tokio::time::sleep(StdDuration::from_millis(30)).await;
    let body = envelope_bytes("task-a", b"payload");
    queue.send(&body).await.unwrap();

    let job = waiter.await.unwrap().unwrap();
    assert_eq!(job.unwrap().body, body);
}

#[tokio::test]
async fn in_flight_duplicate_is_suppressed() {
    let test_db = common::setup_db().await;
    let queue = DedupQueue::new(
        test_db.db.clone(),
        "q",
        5,
        DedupConfig::default(),
        jobqueue_core::sha256_hasher(),
    );
    queue.setup().await.unwrap();

    let body = envelope_bytes("task-a", b"payload");
    let first = queue.send(&body).await.unwrap();
    assert!(first.is_some());

    // Not yet completed or dead-lettered -- still suppressed as a duplicate.
    let second = queue.send(&body).await.unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn different_task_names_are_independent_namespaces() {
    let test_db = common::setup_db().await;
    let queue = DedupQueue::new(
        test_db.db.clone(),
        "q",
        5,
        DedupConfig::default(),
        jobqueue_core::sha256_hasher(),
    );
    queue.setup().await.unwrap();

    let a = envelope_bytes("task-a", b"payload");
    let b = envelope_bytes("task-b", b"payload");

    assert!(queue.send(&a).await.unwrap().is_some());
    // Same message bytes, different task name -- distinct namespace, not a duplicate.
    assert!(queue.send(&b).await.unwrap().is_some());
}
