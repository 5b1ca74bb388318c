//! End-to-end scenarios driven through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use batchq_scheduler::{
    Job, JobConfig, JobStatus, OperationId, OperationStatus, Queue, QueueConfig, QueueError,
    Signal,
};

fn job_of(name: &str, data: Vec<u32>, config: JobConfig) -> Job<u32, u32> {
    Job::with_ids(
        name,
        data,
        |n, _| OperationId::from(n.to_string()),
        config,
        |n: u32| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if n == 3 {
                Err(format!("transform rejected {n}"))
            } else {
                Ok(n + 100)
            }
        },
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn partial_failure_still_completes_the_job() {
    let config = JobConfig::default()
        .with_concurrency_limit(2)
        .with_max_failures_per_operation(2);
    let job = job_of("mixed", vec![1, 2, 3], config);
    let mut sub = job.subscribe();

    job.start().await;

    let export = job.export();
    assert_eq!(export.status, JobStatus::Completed);
    for id in ["1", "2"] {
        let op = export.operation(&OperationId::from(id)).unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.failure_count, 0);
    }
    let three = export.operation(&OperationId::from("3")).unwrap();
    assert_eq!(three.status, OperationStatus::Failed);
    assert_eq!(three.failure_count, 2);
    assert_eq!(export.failed_operations().count(), 1);

    let completions = sub
        .drain()
        .into_iter()
        .filter(|s| matches!(s, Signal::JobCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test(start_paused = true)]
async fn cooldown_holds_back_the_first_operation() {
    let config = JobConfig::default().with_cooldown(Duration::from_millis(200));
    let job = job_of("cool", vec![1], config);
    let mut sub = job.subscribe();

    let began = Instant::now();
    let runner = job.clone();
    let handle = tokio::spawn(async move { runner.start().await });

    loop {
        match sub.recv().await {
            Some(Signal::OperationStarted { .. }) => break,
            Some(_) => continue,
            None => panic!("job bus closed before any operation started"),
        }
    }
    assert!(began.elapsed() >= Duration::from_millis(200));

    handle.await.unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn queued_jobs_never_overlap() {
    let queue = Queue::new();
    let mut sub = queue.subscribe();
    let config = JobConfig::default().with_concurrency_limit(3);

    let first = queue.submit(job_of("first", vec![1, 2, 4, 5], config.clone())).unwrap();
    let second = queue.submit(job_of("second", vec![6, 7], config)).unwrap();
    first.wait().await.unwrap();
    second.wait().await.unwrap();

    let signals = sub.drain();
    let first_done = signals
        .iter()
        .position(|s| matches!(s, Signal::JobCompleted { job } if job.as_str() == "first"))
        .unwrap();
    let second_started = signals
        .iter()
        .position(|s| matches!(s, Signal::JobStarted { job } if job.as_str() == "second"))
        .unwrap();
    assert!(first_done < second_started);

    // Nothing from the second job appears before the first completes.
    assert!(signals[..first_done]
        .iter()
        .all(|s| s.job().map(|j| j.as_str()) == Some("first")));
}

#[tokio::test(start_paused = true)]
async fn single_attempt_budget_fails_without_retry() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let job = Job::new("strict", vec![3u32], JobConfig::default(), move |n: u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<u32, _>(format!("{n} always fails")) }
    })
    .unwrap();

    job.start().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let op = job.operation(&OperationId::from(0)).unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.failure_count, 1);
}

#[tokio::test]
async fn persisted_lookup_without_store_is_a_configuration_error() {
    let queue = Queue::new();

    let err = queue.job_export("missing", true).unwrap_err();
    assert!(matches!(err, QueueError::PersistenceNotConfigured));
}

#[tokio::test(start_paused = true)]
async fn completed_job_is_written_as_json_document() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::from_config(&QueueConfig::default().with_persistence_dir(dir.path()));

    let config = JobConfig::default()
        .with_max_failures_per_operation(1)
        .with_concurrency_limit(2);
    queue
        .submit(job_of("archive", vec![1, 3], config))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join("archive.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["name"], "archive");
    assert_eq!(doc["status"], "completed");
    assert_eq!(doc["operations_completed_count"], 2);
    assert_eq!(doc["operations"][0]["id"], "1");
    assert_eq!(doc["operations"][0]["result"], 101);
    assert_eq!(doc["operations"][1]["status"], "failed");
    assert_eq!(doc["operations"][1]["result"], "transform rejected 3");

    // A new queue over the same directory still answers for it.
    let reopened = Queue::from_config(&QueueConfig::default().with_persistence_dir(dir.path()));
    assert!(reopened.has_job("archive", true).unwrap());
    assert!(!reopened.has_job("archive", false).unwrap());
}

#[tokio::test(start_paused = true)]
async fn live_export_reflects_in_flight_progress() {
    let config = JobConfig::default().with_concurrency_limit(2);
    let job = Job::new("slow", vec![100u64, 100, 100], config, |ms: u64| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok::<_, String>(ms)
    })
    .unwrap();
    let runner = job.clone();
    let handle = tokio::spawn(async move { runner.start().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let export = job.export();
    assert_eq!(export.status, JobStatus::Started);
    assert!(export.start_time.is_some());
    assert_eq!(job.in_flight_count(), 2);
    let started = export
        .operations
        .iter()
        .filter(|op| op.status == OperationStatus::Started)
        .count();
    assert_eq!(started, 2);
    assert_eq!(export.operations[2].status, OperationStatus::Pending);
    assert!(export.operations[0].result.is_none());

    handle.await.unwrap();
    assert_eq!(job.export().progress(), 1.0);
}
