//! Cancellation of in-flight and queued subtasks

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Reply, ScriptedBackend, coordinator, test_config};
use swarm_core::backend::{Backend, BackendError, BackendResponse, Prompt};
use swarm_core::events::{EventKind, MemorySink};
use swarm_core::task::{FailureKind, Task, TaskFailure, TaskStatus};
use swarm_core::{CancellationToken, Coordinator};

fn grants(sink: &MemorySink) -> (usize, usize) {
    let events = sink.events();
    let issued = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::GrantIssued { .. }))
        .count();
    let released = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::GrantReleased { .. }))
        .count();
    (issued, released)
}

#[tokio::test(start_paused = true)]
async fn cancelling_in_flight_subtasks_releases_their_grants() {
    let backend = ScriptedBackend::new(Duration::from_millis(10));
    for prompt in ["a: crawl", "b: crawl", "c: crawl"] {
        backend.script(prompt, [Reply::Hang]);
    }
    let sink = Arc::new(MemorySink::new());
    let coordinator = coordinator(test_config(), &backend, &sink);

    let task = Task::builder("crawl").partitions(["a", "b", "c"]).build();
    let tree = task.tree_id().clone();
    let handle = coordinator.spawn(task);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(grants(&sink), (3, 0));
    assert_eq!(backend.active(), 3);
    assert_eq!(coordinator.governor().budget(&tree).unwrap().active_workers, 3);

    let cancelled_at = tokio::time::Instant::now();
    handle.cancel();
    let failure = handle.join().await.unwrap_err();
    assert_eq!(cancelled_at.elapsed(), Duration::ZERO);

    let TaskFailure::Exhausted { failures, metrics, .. } = failure else {
        panic!("expected exhausted failure");
    };
    assert_eq!(failures.len(), 3);
    assert!(failures.iter().all(|f| f.kind == FailureKind::Cancelled));
    assert_eq!(metrics.retries, 0);

    assert_eq!(grants(&sink), (3, 3));
    assert_eq!(coordinator.governor().stats().grants_released, 3);
    assert_eq!(coordinator.governor().active_trees(), 0);
    assert_eq!(backend.active(), 0);
    assert_eq!(backend.call_count(), 3);

    let cancelled = sink
        .events()
        .iter()
        .filter(|e| matches!(e.kind, EventKind::SubtaskCancelled { .. }))
        .count();
    assert_eq!(cancelled, 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_keeps_finished_results() {
    let backend = ScriptedBackend::new(Duration::from_millis(10));
    backend.script("slow: read", [Reply::Hang]);
    backend.script("queued: read", [Reply::Hang]);
    let sink = Arc::new(MemorySink::new());
    let coordinator = coordinator(test_config(), &backend, &sink);

    let task = Task::builder("read")
        .partitions(["fast", "slow", "queued"])
        .max_parallel(2)
        .build();
    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let outcome = coordinator.submit_with_cancel(task, cancel).await.unwrap();
    trigger.await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Degraded);
    assert_eq!(outcome.aggregate.ordinals(), vec![0]);
    assert_eq!(outcome.failed_ordinals(), vec![1, 2]);
    assert!(outcome.failures.iter().all(|f| f.kind == FailureKind::Cancelled));
    assert_eq!(grants(&sink).0, grants(&sink).1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_backoff_stops_the_retry() {
    let backend = ScriptedBackend::new(Duration::from_millis(10));
    backend.script("flaky", [common::unavailable()]);
    let sink = Arc::new(MemorySink::new());
    let mut config = test_config();
    config.retry.initial_delay_ms = 5_000;
    config.retry.max_delay_ms = 5_000;
    let coordinator = coordinator(config, &backend, &sink);

    let handle = coordinator.spawn(Task::new("flaky"));
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    handle.cancel();
    let failure = handle.join().await.unwrap_err();

    assert_eq!(backend.call_count(), 1);
    let report = failure.report();
    assert_eq!(report.failures[0].kind, "cancelled");
}

/// Cancels the task from inside the call, then answers anyway
struct CancelWhileAnswering {
    cancel: CancellationToken,
    reply: Result<String, BackendError>,
}

#[async_trait]
impl Backend for CancelWhileAnswering {
    async fn invoke(&self, _prompt: Prompt) -> Result<BackendResponse, BackendError> {
        self.cancel.cancel();
        self.reply
            .clone()
            .map(|text| BackendResponse::new(text, 10, 20))
    }
}

async fn run_cancelled_mid_call(reply: Result<String, BackendError>) -> (TaskFailure, Arc<MemorySink>) {
    let cancel = CancellationToken::new();
    let sink = Arc::new(MemorySink::new());
    let coordinator = Coordinator::builder()
        .config(test_config())
        .backend(CancelWhileAnswering {
            cancel: cancel.clone(),
            reply,
        })
        .event_sink(sink.clone())
        .build()
        .unwrap();

    let failure = coordinator
        .submit_with_cancel(Task::new("echo"), cancel)
        .await
        .unwrap_err();
    (failure, sink)
}

#[tokio::test(start_paused = true)]
async fn rejected_output_keeps_its_kind_after_cancellation() {
    let flood = vec!["again"; 64].join(" ");
    let (failure, sink) = run_cancelled_mid_call(Ok(flood)).await;

    let TaskFailure::Exhausted { failures, metrics, .. } = failure else {
        panic!("expected exhausted failure");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::SecurityRejected);
    assert_eq!(metrics.failures_of(FailureKind::SecurityRejected), 1);

    let events = sink.events();
    assert!(!events.iter().any(|e| matches!(e.kind, EventKind::SubtaskCancelled { .. })));
    assert!(events.iter().any(|e| matches!(e.kind, EventKind::SubtaskGaveUp { ordinal: 0, .. })));
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_after_cancellation_is_cancelled() {
    let (failure, sink) =
        run_cancelled_mid_call(Err(BackendError::Unavailable("reset".to_string()))).await;

    let TaskFailure::Exhausted { failures, metrics, .. } = failure else {
        panic!("expected exhausted failure");
    };
    assert_eq!(failures[0].kind, FailureKind::Cancelled);
    assert_eq!(metrics.retries, 0);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e.kind, EventKind::SubtaskCancelled { ordinal: 0 })));
}
