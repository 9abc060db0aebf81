//! Queue worker behavior against the in-memory store
//!
//! These tests verify that:
//! 1. Successful messages are archived in batches
//! 2. A failing message is tried `limit + 1` times, then archived
//! 3. Stopping mid-handler reports nothing and leaves the lease alone
//! 4. A deprecated worker drains and stops on its own
//! 5. A failing store is polled at the poll interval, not in a tight loop

use drover::prelude::*;
use drover::storage::StoreOp;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config() -> QueueWorkerConfig {
    QueueWorkerConfig::default().with_worker(
        WorkerConfig::default()
            .with_queue_name("emails")
            .with_max_poll_seconds(1)
            .with_poll_interval(Duration::from_millis(100)),
    )
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(120), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_successful_messages_are_archived_in_batches() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..5 {
        store.send("emails", json!({"n": i}));
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let worker = create_queue_worker(
        move |_: Value, _ctx: MessageContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        },
        config().with_archive_batch_size(100),
        store.clone(),
    )
    .unwrap();

    worker.start().await.unwrap();
    wait_until(|| handled.load(Ordering::SeqCst) == 5).await;
    wait_until(|| store.archived_ids("emails").len() == 5).await;

    // One timed batch, not one archive per message.
    assert_eq!(store.call_count(StoreOp::ArchiveBatch), 1);
    assert_eq!(store.call_count(StoreOp::Archive), 0);
    worker.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failing_message_is_retried_then_archived() {
    let store = Arc::new(InMemoryStore::new());
    let msg_id = store.send("emails", json!({"to": "nobody"}));

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let worker = create_queue_worker(
        move |_: Value, ctx: MessageContext| {
            let counter = counter.clone();
            async move {
                let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(ctx.read_count as usize, seen);
                Err::<(), _>("smtp unavailable")
            }
        },
        config().with_retry(RetryConfig::fixed(5, 1)),
        store.clone(),
    )
    .unwrap();

    worker.start().await.unwrap();
    wait_until(|| store.archived_ids("emails") == vec![msg_id]).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 6);
    assert_eq!(store.call_count(StoreOp::SetVisibility), 5);
    assert_eq!(store.call_count(StoreOp::Archive), 1);
    assert_eq!(store.archived("emails")[0].read_ct, 6);
    worker.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_handler_leaves_message_leased() {
    let store = Arc::new(InMemoryStore::new());
    let msg_id = store.send("emails", json!({}));

    let started = Arc::new(AtomicUsize::new(0));
    let flag = started.clone();
    let worker = create_queue_worker(
        move |_: Value, _ctx: MessageContext| {
            let flag = flag.clone();
            async move {
                flag.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, BoxError>(())
            }
        },
        config(),
        store.clone(),
    )
    .unwrap();

    worker.start().await.unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;
    worker.stop().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(store.call_count(StoreOp::SetVisibility), 0);
    assert_eq!(store.call_count(StoreOp::Archive), 0);
    assert_eq!(store.call_count(StoreOp::ArchiveBatch), 0);
    let message = store.message("emails", msg_id).expect("message still queued");
    assert_eq!(message.read_ct, 1);
}

#[tokio::test(start_paused = true)]
async fn test_deprecated_worker_stops_itself() {
    let store = Arc::new(InMemoryStore::new());
    let worker = create_queue_worker(
        |_: Value, _ctx: MessageContext| async { Ok::<_, BoxError>(()) },
        config().with_worker(
            WorkerConfig::default()
                .with_queue_name("emails")
                .with_max_poll_seconds(1)
                .with_heartbeat_interval(Duration::from_secs(2))
                .with_close_store_on_stop(true),
        ),
        store.clone(),
    )
    .unwrap();

    worker.start().await.unwrap();
    let worker_id = worker.worker_id().unwrap();
    store.deprecate_workers("emails");

    tokio::time::timeout(Duration::from_secs(30), worker.stopped())
        .await
        .expect("worker did not stop");
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(store.worker(worker_id).unwrap().stopped_at.is_some());
    assert_eq!(store.call_count(StoreOp::Close), 1);

    // Stopping again is a no-op.
    worker.stop().await.unwrap();
    assert_eq!(store.call_count(StoreOp::MarkWorkerStopped), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_store_is_polled_at_poll_interval() {
    let store = Arc::new(InMemoryStore::new());
    store.fail_on(StoreOp::ReadWithPoll);
    let worker = create_queue_worker(
        |_: Value, _ctx: MessageContext| async { Ok::<_, BoxError>(()) },
        config(),
        store.clone(),
    )
    .unwrap();

    worker.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    worker.stop().await.unwrap();

    // 100ms poll interval: about ten attempts in a second.
    let polls = store.call_count(StoreOp::ReadWithPoll);
    assert!((5..=12).contains(&polls), "polled {polls} times");
    assert!(!store.is_closed());
}
