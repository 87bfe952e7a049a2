//! End-to-end tests for the queue protocol
//!
//! Run with: cargo test -p arbor-queue --test queue_integration_test
//!
//! Everything runs against the in-memory store; multiple queues and workers
//! share one store instance to exercise the cross-process races the protocol
//! is built around.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use arbor_queue::{
    processing_fn, InMemoryTreeStore, Queue, QueueOptions, QueueRefs, QueueWorker, TaskSpec,
    TreePath, TreeStore, WorkerOptions,
};

/// Opt into worker logs with RUST_LOG=arbor_queue=debug
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tasks() -> TreePath {
    TreePath::parse("queue/tasks")
}

fn specs() -> TreePath {
    TreePath::parse("queue/specs")
}

fn refs() -> QueueRefs {
    QueueRefs::rooted_at(TreePath::parse("queue"))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(75)).await;
}

/// Poll the record at `path` until `pred` accepts it
async fn wait_for(
    store: &InMemoryTreeStore,
    path: &TreePath,
    pred: impl Fn(Option<&Value>) -> bool,
) {
    timeout(Duration::from_secs(5), async {
        loop {
            let value = store.get(path).await.unwrap();
            if pred(value.as_ref()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("record did not reach the expected shape in time");
}

// ============================================
// Exactly-once claiming
// ============================================

#[tokio::test]
async fn test_racing_pools_process_each_task_exactly_once() {
    init_tracing();
    let store = Arc::new(InMemoryTreeStore::new());
    let invocations = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    // Two independent queues, as if in two processes, each with two workers
    let mut queues = Vec::new();
    for _ in 0..2 {
        let invocations = invocations.clone();
        let done_tx = done_tx.clone();
        let queue = Queue::new(
            store.clone(),
            refs(),
            QueueOptions::default().with_num_workers(2),
            processing_fn(move |_data, handle| {
                let invocations = invocations.clone();
                let done_tx = done_tx.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    handle.resolve(None).await.unwrap();
                    let _ = done_tx.send(());
                }
            }),
        )
        .await
        .unwrap();
        queues.push(queue);
    }

    for n in 0..5 {
        store.push(&tasks(), json!({"n": n})).await.unwrap();
    }
    for _ in 0..5 {
        timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("task was never processed")
            .unwrap();
    }
    settle().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 5);
    // Default spec has no finished state: resolved tasks are deleted
    assert_eq!(store.child_count(&tasks()), 0);

    for queue in queues {
        queue.shutdown().await;
    }
}

#[tokio::test]
async fn test_tasks_claimed_in_key_order() {
    let store = Arc::new(InMemoryTreeStore::new());
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default(),
        processing_fn(move |data, handle| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(data["n"].clone());
                handle.resolve(None).await.unwrap();
            }
        }),
    )
    .await
    .unwrap();

    for n in 0..3 {
        store.push(&tasks(), json!({"n": n})).await.unwrap();
    }

    for expected in 0..3 {
        let seen = timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("task was never processed")
            .unwrap();
        assert_eq!(seen, json!(expected));
    }
    queue.shutdown().await;
}

// ============================================
// Rejection, retries, and the attempts counter
// ============================================

#[tokio::test]
async fn test_retry_budget_then_error_state() {
    let store = Arc::new(InMemoryTreeStore::new());
    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_seen = invocations.clone();

    store
        .set(
            &specs().child("flaky"),
            json!({
                "start_state": "pending",
                "in_progress_state": "working",
                "error_state": "failed",
                "retries": 2,
            }),
        )
        .await
        .unwrap();

    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default()
            .with_spec_id("flaky")
            .with_suppress_stack(true),
        processing_fn(move |_data, handle| {
            let invocations = invocations_seen.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                handle.reject("simulated failure").await.unwrap();
            }
        }),
    )
    .await
    .unwrap();

    let key = store
        .push(&tasks(), json!({"_state": "pending", "n": 1}))
        .await
        .unwrap();
    let path = tasks().child(key);

    wait_for(&store, &path, |v| {
        v.and_then(|v| v.get("_state")) == Some(&json!("failed"))
    })
    .await;
    settle().await;

    // Two retries means three attempts total before landing in the error state
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let record = store.get(&path).await.unwrap().unwrap();
    let details = &record["_error_details"];
    assert_eq!(details["attempts"], json!(3));
    assert_eq!(details["previous_state"], json!("working"));
    assert_eq!(details["error"], json!("simulated failure"));
    assert!(details.get("error_stack").is_none());
    assert!(record.get("_owner").is_none());

    queue.shutdown().await;
}

#[tokio::test]
async fn test_zero_retries_goes_straight_to_error() {
    let store = Arc::new(InMemoryTreeStore::new());

    store
        .set(
            &specs().child("once"),
            json!({
                "start_state": "pending",
                "in_progress_state": "working",
            }),
        )
        .await
        .unwrap();

    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default().with_spec_id("once"),
        processing_fn(|_data, handle| async move {
            handle.reject("no retry budget").await.unwrap();
        }),
    )
    .await
    .unwrap();

    let key = store
        .push(&tasks(), json!({"_state": "pending"}))
        .await
        .unwrap();
    let path = tasks().child(key);

    wait_for(&store, &path, |v| {
        v.and_then(|v| v.get("_state")) == Some(&json!("error"))
    })
    .await;

    let record = store.get(&path).await.unwrap().unwrap();
    assert_eq!(record["_error_details"]["attempts"], json!(1));
    queue.shutdown().await;
}

#[tokio::test]
async fn test_attempts_reset_across_regime_change() {
    let store = Arc::new(InMemoryTreeStore::new());
    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_seen = invocations.clone();

    store
        .set(
            &specs().child("flaky"),
            json!({
                "start_state": "pending",
                "in_progress_state": "working",
                "retries": 2,
            }),
        )
        .await
        .unwrap();

    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default().with_spec_id("flaky"),
        processing_fn(move |_data, handle| {
            let invocations = invocations_seen.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                handle.reject("still failing").await.unwrap();
            }
        }),
    )
    .await
    .unwrap();

    // Error details carried over from a run under a different in-progress
    // state: the attempts counter must restart at zero, not carry the five
    let key = store
        .push(
            &tasks(),
            json!({
                "_state": "pending",
                "_error_details": {"previous_state": "old_working", "attempts": 5, "error": "stale"},
            }),
        )
        .await
        .unwrap();
    let path = tasks().child(key);

    wait_for(&store, &path, |v| {
        v.and_then(|v| v.get("_state")) == Some(&json!("error"))
    })
    .await;
    settle().await;

    // A carried-over counter of 5 would have errored on the first rejection
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let record = store.get(&path).await.unwrap().unwrap();
    assert_eq!(record["_error_details"]["attempts"], json!(3));
    queue.shutdown().await;
}

#[tokio::test]
async fn test_rejected_twice_then_resolved_clears_error_details() {
    let store = Arc::new(InMemoryTreeStore::new());
    let (attempt_tx, mut attempt_rx) = mpsc::unbounded_channel();

    store
        .set(
            &specs().child("flaky"),
            json!({
                "start_state": "pending",
                "in_progress_state": "working",
                "finished_state": "done",
                "retries": 2,
            }),
        )
        .await
        .unwrap();

    // Unsanitized payloads expose the attempts counter to the processing fn
    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default()
            .with_spec_id("flaky")
            .with_sanitize(false),
        processing_fn(move |data, handle| {
            let attempt_tx = attempt_tx.clone();
            async move {
                let prior = data["_error_details"]["attempts"].as_u64();
                let _ = attempt_tx.send(prior);
                if prior.unwrap_or(0) < 2 {
                    handle.reject("transient glitch").await.unwrap();
                } else {
                    handle.resolve(Some(json!({"x": 1}))).await.unwrap();
                }
            }
        }),
    )
    .await
    .unwrap();

    let key = store
        .push(&tasks(), json!({"_state": "pending", "n": 9}))
        .await
        .unwrap();
    let path = tasks().child(key);

    // Two rejections accumulate attempts 1 then 2 before the third run resolves
    assert_eq!(attempt_rx.recv().await.unwrap(), None);
    assert_eq!(attempt_rx.recv().await.unwrap(), Some(1));
    assert_eq!(attempt_rx.recv().await.unwrap(), Some(2));

    wait_for(&store, &path, |v| {
        v.and_then(|v| v.get("_state")) == Some(&json!("done"))
    })
    .await;
    settle().await;

    // Resolution replaces the payload and clears the accumulated error state
    let record = store.get(&path).await.unwrap().unwrap();
    assert_eq!(record["_state"], json!("done"));
    assert_eq!(record["x"], json!(1));
    assert_eq!(record["_progress"], json!(100));
    assert!(record.get("n").is_none());
    assert!(record.get("_owner").is_none());
    assert!(record.get("_error_details").is_none());

    queue.shutdown().await;
}

// ============================================
// Resolution overrides
// ============================================

#[tokio::test]
async fn test_new_state_override_and_delete() {
    let store = Arc::new(InMemoryTreeStore::new());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    store
        .set(
            &specs().child("router"),
            json!({
                "start_state": "pending",
                "in_progress_state": "working",
                "finished_state": "done",
            }),
        )
        .await
        .unwrap();

    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default().with_spec_id("router"),
        processing_fn(move |data, handle| {
            let done_tx = done_tx.clone();
            async move {
                let output = match data["route"].as_str() {
                    Some("review") => Some(json!({"_new_state": "needs_review", "checked": true})),
                    Some("delete") => Some(json!({"_new_state": false})),
                    _ => None,
                };
                handle.resolve(output).await.unwrap();
                let _ = done_tx.send(());
            }
        }),
    )
    .await
    .unwrap();

    let review_key = store
        .push(&tasks(), json!({"_state": "pending", "route": "review"}))
        .await
        .unwrap();
    done_rx.recv().await.unwrap();

    let delete_key = store
        .push(&tasks(), json!({"_state": "pending", "route": "delete"}))
        .await
        .unwrap();
    done_rx.recv().await.unwrap();

    let plain_key = store
        .push(&tasks(), json!({"_state": "pending"}))
        .await
        .unwrap();
    done_rx.recv().await.unwrap();
    settle().await;

    // _new_state string wins over the configured finished state
    let review = store
        .get(&tasks().child(review_key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(review["_state"], json!("needs_review"));
    assert_eq!(review["checked"], json!(true));
    assert!(review.get("route").is_none());

    // _new_state false deletes even with a finished state configured
    assert_eq!(store.get(&tasks().child(delete_key)).await.unwrap(), None);

    // No override lands in the finished state, payload replaced by the output
    let plain = store.get(&tasks().child(plain_key)).await.unwrap().unwrap();
    assert_eq!(plain["_state"], json!("done"));
    assert_eq!(plain["_progress"], json!(100));
    assert!(plain.get("_owner").is_none());

    queue.shutdown().await;
}

// ============================================
// Timeout reclamation
// ============================================

#[tokio::test]
async fn test_stale_task_reclaimed_and_reprocessed() {
    init_tracing();
    let store = Arc::new(InMemoryTreeStore::new());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    // A task claimed long ago by a worker that no longer exists
    store
        .set(
            &tasks().child("stuck"),
            json!({
                "_state": "working",
                "_state_changed": 1,
                "_owner": "ghost:0:deadbeef:1",
                "file": "a.png",
            }),
        )
        .await
        .unwrap();

    let worker = QueueWorker::new(
        store.clone(),
        tasks(),
        "q:0",
        WorkerOptions::default(),
        processing_fn(move |data, handle| {
            let done_tx = done_tx.clone();
            async move {
                assert_eq!(data["file"], json!("a.png"));
                handle.resolve(None).await.unwrap();
                let _ = done_tx.send(());
            }
        }),
    );
    let spec = TaskSpec::new("working")
        .with_start_state("pending")
        .with_finished_state("done")
        .with_timeout(Duration::from_millis(100));
    worker.set_task_spec(Some(spec)).await;

    // The supervisor resets the ghost-owned record, then the claim watch
    // picks it back up
    timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .expect("reclaimed task was never processed")
        .unwrap();
    settle().await;

    let record = store.get(&tasks().child("stuck")).await.unwrap().unwrap();
    assert_eq!(record["_state"], json!("done"));
    assert!(record.get("_owner").is_none());
    worker.shutdown().await;
}

#[tokio::test]
async fn test_live_task_not_reclaimed_before_timeout() {
    let store = Arc::new(InMemoryTreeStore::new());
    let (claimed_tx, mut claimed_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));

    let worker = QueueWorker::new(
        store.clone(),
        tasks(),
        "q:0",
        WorkerOptions::default(),
        processing_fn(move |_data, handle| {
            let claimed_tx = claimed_tx.clone();
            let release_rx = release_rx.clone();
            async move {
                let _ = claimed_tx.send(());
                release_rx.lock().await.recv().await;
                handle.resolve(None).await.unwrap();
            }
        }),
    );
    let spec = TaskSpec::new("working")
        .with_start_state("pending")
        .with_finished_state("done")
        .with_timeout(Duration::from_secs(60));
    worker.set_task_spec(Some(spec)).await;

    let key = store
        .push(&tasks(), json!({"_state": "pending"}))
        .await
        .unwrap();
    claimed_rx.recv().await.unwrap();
    settle().await;

    // Well within the timeout the claim must stand
    let record = store.get(&tasks().child(&key)).await.unwrap().unwrap();
    assert_eq!(record["_state"], json!("working"));
    assert!(record.get("_owner").is_some());

    let _ = release_tx.send(());
    wait_for(&store, &tasks().child(&key), |v| {
        v.and_then(|v| v.get("_state")) == Some(&json!("done"))
    })
    .await;
    worker.shutdown().await;
}

// ============================================
// Fencing across spec changes
// ============================================

#[tokio::test]
async fn test_spec_change_fences_inflight_task() {
    init_tracing();
    let store = Arc::new(InMemoryTreeStore::new());
    let (claimed_tx, mut claimed_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let worker = QueueWorker::new(
        store.clone(),
        tasks(),
        "q:0",
        WorkerOptions::default(),
        processing_fn(move |_data, handle| {
            let claimed_tx = claimed_tx.clone();
            let release_rx = release_rx.clone();
            let done_tx = done_tx.clone();
            async move {
                let _ = claimed_tx.send(());
                release_rx.lock().await.recv().await;
                // Stale by now: the spec changed while we were working
                handle.resolve(Some(json!({"should": "not land"}))).await.unwrap();
                let _ = done_tx.send(());
            }
        }),
    );
    let spec = TaskSpec::new("working")
        .with_start_state("pending")
        .with_finished_state("done");
    worker.set_task_spec(Some(spec)).await;

    let key = store
        .push(&tasks(), json!({"_state": "pending", "n": 1}))
        .await
        .unwrap();
    claimed_rx.recv().await.unwrap();

    // Dropping the spec resets the in-flight task and bumps the fencing token
    worker.set_task_spec(None).await;
    let _ = release_tx.send(());
    done_rx.recv().await.unwrap();
    settle().await;

    let record = store.get(&tasks().child(&key)).await.unwrap().unwrap();
    assert_eq!(record["_state"], json!("pending"));
    assert_eq!(record["n"], json!(1));
    assert!(record.get("_owner").is_none());
    assert!(record.get("should").is_none());
    worker.shutdown().await;
}

#[tokio::test]
async fn test_spec_record_update_retargets_workers() {
    let store = Arc::new(InMemoryTreeStore::new());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    store
        .set(
            &specs().child("jobs"),
            json!({
                "start_state": "phase_one",
                "in_progress_state": "working",
                "finished_state": "done",
            }),
        )
        .await
        .unwrap();

    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default().with_spec_id("jobs"),
        processing_fn(move |_data, handle| {
            let done_tx = done_tx.clone();
            async move {
                handle.resolve(None).await.unwrap();
                let _ = done_tx.send(());
            }
        }),
    )
    .await
    .unwrap();

    // A task for the second phase sits untouched under the first spec
    let key = store
        .push(&tasks(), json!({"_state": "phase_two"}))
        .await
        .unwrap();
    settle().await;
    let record = store.get(&tasks().child(&key)).await.unwrap().unwrap();
    assert_eq!(record["_state"], json!("phase_two"));

    // Updating the spec record retargets every worker
    store
        .set(
            &specs().child("jobs"),
            json!({
                "start_state": "phase_two",
                "in_progress_state": "working",
                "finished_state": "done",
            }),
        )
        .await
        .unwrap();

    timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .expect("retargeted worker never claimed the task")
        .unwrap();
    settle().await;

    let record = store.get(&tasks().child(&key)).await.unwrap().unwrap();
    assert_eq!(record["_state"], json!("done"));
    queue.shutdown().await;
}

// ============================================
// Payload sanitization
// ============================================

#[tokio::test]
async fn test_unsanitized_payload_carries_bookkeeping_and_id() {
    let store = Arc::new(InMemoryTreeStore::new());
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default().with_sanitize(false),
        processing_fn(move |data, handle| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(data);
                handle.resolve(None).await.unwrap();
            }
        }),
    )
    .await
    .unwrap();

    let key = store.push(&tasks(), json!({"n": 7})).await.unwrap();
    let data = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("task was never processed")
        .unwrap();

    assert_eq!(data["_id"], json!(key));
    assert_eq!(data["_state"], json!("in_progress"));
    assert_eq!(data["_progress"], json!(0));
    assert!(data.get("_owner").is_some());
    assert_eq!(data["n"], json!(7));
    queue.shutdown().await;
}

// ============================================
// Shutdown semantics
// ============================================

#[tokio::test]
async fn test_shutdown_waits_for_inflight_task() {
    init_tracing();
    let store = Arc::new(InMemoryTreeStore::new());
    let (claimed_tx, mut claimed_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));

    let queue = Queue::new(
        store.clone(),
        refs(),
        QueueOptions::default(),
        processing_fn(move |_data, handle| {
            let claimed_tx = claimed_tx.clone();
            let release_rx = release_rx.clone();
            async move {
                let _ = claimed_tx.send(());
                release_rx.lock().await.recv().await;
                handle.resolve(None).await.unwrap();
            }
        }),
    )
    .await
    .unwrap();

    store.push(&tasks(), json!({"n": 1})).await.unwrap();
    claimed_rx.recv().await.unwrap();

    let shutdown = tokio::spawn(async move {
        queue.shutdown().await;
    });

    // Shutdown must not complete while the task is in flight
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!shutdown.is_finished());

    let _ = release_tx.send(());
    timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("shutdown never completed")
        .unwrap();

    // The in-flight task was resolved, not abandoned
    assert_eq!(store.child_count(&tasks()), 0);
}
