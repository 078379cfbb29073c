//! Integration tests for the pause/resume lifecycle
//!
//! Drives instances through a worker with a scripted executor and checks the
//! externally visible behavior: queries, resumes, timeouts, cancellation,
//! and the notifications observers receive.

mod support;

use pausable::runtime::{
    ErrorKind, InstanceId, InstanceStatus, RunParameters, Worker, WorkerError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{Scripted, config, eventually, wait_for};
use tempfile::TempDir;

fn worker(executor: Arc<Scripted>, pause_timeout: Duration) -> (Worker, TempDir) {
    let temp = TempDir::new().unwrap();
    let worker = Worker::new(config(temp.path(), false, pause_timeout), executor).unwrap();
    (worker, temp)
}

#[tokio::test]
async fn test_pause_resume_scenario() {
    let executor = Arc::new(Scripted::new([1, 2, 3], [2]));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));

    let handle = worker.start(RunParameters::new(InstanceId::new("wf-1"))).unwrap();
    wait_for(&handle, InstanceStatus::AwaitingResume).await;

    assert!(handle.is_paused());
    assert!(worker.is_paused(&InstanceId::new("wf-1")).unwrap());
    assert_eq!(executor.calls(), vec!["started", "fetch", "block 1", "block 2", "paused"]);

    let ack = worker
        .resume(&InstanceId::new("wf-1"), Some(json!({})))
        .await
        .unwrap();
    assert_eq!(serde_json::to_value(&ack).unwrap(), json!({"message": "resumed"}));

    let outcome = handle.result().await.unwrap();
    assert_eq!(outcome.status(), InstanceStatus::Completed);
    assert!(!handle.is_paused());
    assert_eq!(
        executor.calls(),
        vec!["started", "fetch", "block 1", "block 2", "paused", "resumed", "block 3", "ended"]
    );

    let result = outcome.result().unwrap();
    assert_eq!(result["1"], json!({"block": 1}));
    assert_eq!(result["3"], json!({"block": 3}));
    assert_eq!(executor.ended.lock()[0].0.as_ref(), Some(result));
}

#[tokio::test]
async fn test_not_paused_before_first_block_or_after_last() {
    let executor = Arc::new(Scripted::new([1, 2], []));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));

    let handle = worker.start(RunParameters::new(InstanceId::new("wf-flat"))).unwrap();
    assert!(!handle.is_paused());

    let outcome = handle.result().await.unwrap();
    assert_eq!(outcome.status(), InstanceStatus::Completed);
    assert!(!handle.is_paused());
    assert_eq!(executor.count("paused"), 0);
}

#[tokio::test]
async fn test_resume_after_completion_is_a_precondition_failure() {
    let executor = Arc::new(Scripted::new([1], []));
    let (worker, _temp) = worker(executor, Duration::from_secs(60));
    let id = InstanceId::new("wf-done");

    let handle = worker.start(RunParameters::new(id.clone())).unwrap();
    handle.result().await.unwrap();

    for payload in [Some(json!({})), Some(json!(5)), None] {
        let err = worker.resume(&id, payload).await.unwrap_err();
        match err {
            WorkerError::Interpreter(e) => {
                assert_eq!(e.kind(), ErrorKind::Precondition);
                assert!(e.to_string().contains("wf-done"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(handle.status(), InstanceStatus::Completed);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected_without_mutation() {
    let executor = Arc::new(Scripted::new([1, 2], [1]));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));

    let handle = worker.start(RunParameters::new(InstanceId::new("wf-bad"))).unwrap();
    wait_for(&handle, InstanceStatus::AwaitingResume).await;

    for payload in [None, Some(json!(null)), Some(json!("go")), Some(json!([1, 2])), Some(json!(3))] {
        let err = handle.resume(payload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(handle.is_paused());
        assert_eq!(handle.status(), InstanceStatus::AwaitingResume);
    }
    assert_eq!(executor.count("resumed"), 0);

    handle.resume(Some(json!({"approved": true}))).await.unwrap();
    assert_eq!(handle.result().await.unwrap().status(), InstanceStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resumes_admit_exactly_one() {
    let executor = Arc::new(Scripted::new([1, 2], [1]));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));

    let handle = worker.start(RunParameters::new(InstanceId::new("wf-race"))).unwrap();
    wait_for(&handle, InstanceStatus::AwaitingResume).await;

    let attempts: Vec<_> = (0..16)
        .map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.resume(Some(json!({ "attempt": i }))).await })
        })
        .collect();

    let mut accepted = 0;
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::Precondition);
                rejected += 1;
            }
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(rejected, 15);
    handle.result().await.unwrap();
    assert_eq!(executor.count("resumed"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resumed_notification_precedes_remaining_blocks() {
    for round in 0..20 {
        let executor = Arc::new(Scripted::new([1, 2, 3], [2]));
        let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));

        let handle = worker
            .start(RunParameters::new(InstanceId::new(format!("wf-order-{round}"))))
            .unwrap();
        wait_for(&handle, InstanceStatus::AwaitingResume).await;
        handle.resume(Some(json!({}))).await.unwrap();
        handle.result().await.unwrap();

        assert_eq!(
            executor.calls()[4..],
            ["paused", "resumed", "block 3", "ended"],
            "round {round}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_pause_timeout_fails_the_run() {
    let executor = Arc::new(Scripted::new([1, 2, 3], [2]));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(3600));

    let handle = worker.start(RunParameters::new(InstanceId::new("wf-slow"))).unwrap();
    wait_for(&handle, InstanceStatus::AwaitingResume).await;

    tokio::time::sleep(Duration::from_secs(3500)).await;
    assert!(handle.is_paused());
    assert!(handle.try_result().is_none());

    let outcome = handle.result().await.unwrap();
    let error = outcome.error().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.message.contains("did not receive a continuation"));
    assert_eq!(executor.count("block 3"), 0);

    let ended = executor.ended.lock();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].1.as_ref().unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_cancel_while_paused() {
    let executor = Arc::new(Scripted::new([1, 2, 3], [2]));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));
    let id = InstanceId::new("wf-cancel");

    let handle = worker.start(RunParameters::new(id.clone())).unwrap();
    wait_for(&handle, InstanceStatus::AwaitingResume).await;

    worker.cancel(&id).unwrap();
    let outcome = handle.result().await.unwrap();

    let error = outcome.error().unwrap();
    assert_eq!(error.kind, ErrorKind::Canceled);
    assert!(error.is_canceled());
    assert_eq!(handle.status(), InstanceStatus::Failed);
    assert!(!handle.is_paused());

    assert_eq!(executor.count("ended"), 1);
    assert!(executor.ended.lock()[0].1.as_ref().unwrap().is_canceled());
    assert_eq!(executor.count("block 3"), 0);
}

#[tokio::test]
async fn test_definition_unavailable_after_retries() {
    let executor = Arc::new(Scripted::new([1], []).failing_definition(10));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));

    let handle = worker.start(RunParameters::new(InstanceId::new("wf-nodef"))).unwrap();
    let outcome = handle.result().await.unwrap();

    let error = outcome.error().unwrap();
    assert_eq!(error.kind, ErrorKind::DefinitionUnavailable);
    assert!(error.trace.as_ref().unwrap().contains("gave up after 3 attempts"));
    assert_eq!(executor.count("fetch"), 3);
    assert_eq!(executor.count("block 1"), 0);
    assert_eq!(executor.count("ended"), 1);
}

#[tokio::test]
async fn test_definition_recovers_within_retry_budget() {
    let executor = Arc::new(Scripted::new([1], []).failing_definition(2));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));

    let handle = worker.start(RunParameters::new(InstanceId::new("wf-flaky"))).unwrap();
    let outcome = handle.result().await.unwrap();

    assert_eq!(outcome.status(), InstanceStatus::Completed);
    assert_eq!(executor.count("fetch"), 3);
}

#[tokio::test]
async fn test_multiple_pause_points_alternate_notifications() {
    let executor = Arc::new(Scripted::new([1, 2, 3, 4], [1, 3]));
    let (worker, _temp) = worker(executor.clone(), Duration::from_secs(60));

    let handle = worker.start(RunParameters::new(InstanceId::new("wf-multi"))).unwrap();
    for round in 1..=2 {
        eventually(|| executor.count("paused") == round).await;
        handle.resume(Some(json!({}))).await.unwrap();
    }
    handle.result().await.unwrap();

    let notifications: Vec<_> = executor
        .calls()
        .into_iter()
        .filter(|c| c == "paused" || c == "resumed")
        .collect();
    assert_eq!(notifications, vec!["paused", "resumed", "paused", "resumed"]);
}

#[tokio::test]
async fn test_worker_routes_by_instance_id() {
    let executor = Arc::new(Scripted::new([1], [1]));
    let (worker, _temp) = worker(executor, Duration::from_secs(60));
    let id = InstanceId::new("wf-routed");

    worker.start(RunParameters::new(id.clone())).unwrap();
    let err = worker.start(RunParameters::new(id.clone())).unwrap_err();
    assert!(matches!(err, WorkerError::AlreadyExists(_)));

    let missing = InstanceId::new("wf-missing");
    assert!(matches!(worker.is_paused(&missing), Err(WorkerError::NotFound(_))));
    assert!(matches!(
        worker.resume(&missing, Some(json!({}))).await,
        Err(WorkerError::NotFound(_))
    ));
    assert_eq!(worker.instances(), vec![id.clone()]);

    let handle = worker.handle(&id).unwrap();
    handle.cancel();
    handle.result().await.unwrap();
}
