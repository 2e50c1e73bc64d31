//! End-to-end pipeline over the in-memory store and broker.
//!
//! Submission → worker → completion, plus the failure paths: evaluation
//! errors, duplicate deliveries, poison items and orphaned jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use calcq::compute::{Arithmetic, Evaluate};
use calcq::error::{Error, Result};
use calcq::model::{DeadLetter, JobId, JobStatus, NewJob, RequestItem, ResultItem};
use calcq::pipeline::{CompletionLoop, LoopConfig, Reconciler, Submitter, Worker};
use calcq::queue::{Delivery, MemoryQueue, MessageId, QueueSettings, ReceiptHandle, WorkQueue, publish};
use calcq::store::{JobStore, MemoryJobStore};
use serde_json::json;

struct Pipeline {
    store: Arc<MemoryJobStore>,
    requests: Arc<MemoryQueue>,
    results: Arc<MemoryQueue>,
    dead_letters: Arc<MemoryQueue>,
    submitter: Submitter,
    worker: Worker,
    completion: CompletionLoop,
}

fn loop_config(max_deliveries: u32) -> LoopConfig {
    LoopConfig {
        receive_wait: Duration::from_millis(20),
        max_deliveries,
    }
}

fn pipeline_with(visibility: Duration, max_deliveries: u32) -> Pipeline {
    let settings = QueueSettings {
        visibility_timeout: visibility,
        batch_size: 10,
    };
    let store = Arc::new(MemoryJobStore::new());
    let requests = Arc::new(MemoryQueue::new("math_queue", settings));
    let results = Arc::new(MemoryQueue::new("math_result_queue", settings));
    let dead_letters = Arc::new(MemoryQueue::new("math_dead_letter", settings));

    let submitter = Submitter::new(store.clone(), requests.clone());
    let worker = Worker::new(
        requests.clone(),
        results.clone(),
        dead_letters.clone(),
        Arc::new(Arithmetic),
        loop_config(max_deliveries),
    );
    let completion = CompletionLoop::new(
        results.clone(),
        store.clone(),
        dead_letters.clone(),
        loop_config(max_deliveries),
    );

    Pipeline {
        store,
        requests,
        results,
        dead_letters,
        submitter,
        worker,
        completion,
    }
}

fn pipeline() -> Pipeline {
    pipeline_with(Duration::from_secs(60), 5)
}

async fn dead_letters(q: &MemoryQueue) -> Vec<DeadLetter> {
    q.payloads()
        .await
        .into_iter()
        .map(|p| serde_json::from_value(p).unwrap())
        .collect()
}

/// A broker that refuses every write.
struct UnreachableQueue;

#[async_trait]
impl WorkQueue for UnreachableQueue {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn enqueue(&self, _payload: &serde_json::Value) -> Result<MessageId> {
        Err(Error::Queue("connection refused".to_string()))
    }

    async fn receive_batch(&self, _max_wait: Duration) -> Result<Vec<Delivery>> {
        Err(Error::Queue("connection refused".to_string()))
    }

    async fn acknowledge(&self, _handle: &ReceiptHandle) -> Result<()> {
        Err(Error::Queue("connection refused".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_job_is_pending_until_completed() {
    let p = pipeline();
    let id = p
        .submitter
        .submit(NewJob::new("8 + 12", "ada"))
        .await
        .unwrap();

    let job = p.store.get_job(id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.result, None);
    assert_eq!(job.completed, None);

    let queued = p.requests.payloads().await;
    assert_eq!(queued.len(), 1);
    let request: RequestItem = serde_json::from_value(queued[0].clone()).unwrap();
    assert_eq!(request.id, id);
    assert_eq!(request.submitter, "ada");
    assert_eq!(request.expression, "8 + 12");

    assert_eq!(p.worker.poll_once().await.unwrap(), 1);
    assert!(p.requests.is_empty().await);
    assert_eq!(p.results.payloads().await, vec![json!({"id": id, "result": 20.0})]);
    // Evaluated but not yet reconciled.
    assert!(p.store.get_job(id).await.unwrap().is_pending());

    assert_eq!(p.completion.poll_once().await.unwrap(), 1);
    assert!(p.results.is_empty().await);

    let job = p.store.get_job(id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.result, Some(20.0));
    assert!(job.completed.unwrap() >= job.created);
    assert!(p.dead_letters.is_empty().await);
}

#[tokio::test]
async fn parenthesized_expression_resolves() {
    let p = pipeline();
    let id = p
        .submitter
        .submit(NewJob::new("2 * (3+4)", "ada"))
        .await
        .unwrap();

    p.worker.poll_once().await.unwrap();
    p.completion.poll_once().await.unwrap();

    assert_eq!(p.store.get_job(id).await.unwrap().result, Some(14.0));
}

#[tokio::test]
async fn concurrent_submissions_each_resolve_to_their_own_result() {
    let p = pipeline();
    let mut handles = Vec::new();
    for n in 0..25 {
        let submitter = p.submitter.clone();
        handles.push(tokio::spawn(async move {
            let id = submitter
                .submit(NewJob::new(format!("{n} * 2"), format!("student-{n}")))
                .await
                .unwrap();
            (n, id)
        }));
    }
    let mut submitted = Vec::new();
    for handle in handles {
        submitted.push(handle.await.unwrap());
    }
    assert_eq!(p.store.len().await, 25);

    while !p.requests.is_empty().await {
        p.worker.poll_once().await.unwrap();
    }
    while !p.results.is_empty().await {
        p.completion.poll_once().await.unwrap();
    }

    for (n, id) in submitted {
        let job = p.store.get_job(id).await.unwrap();
        assert_eq!(job.submitter, format!("student-{n}"));
        assert_eq!(job.result, Some(f64::from(n) * 2.0));
    }
}

#[tokio::test]
async fn custom_evaluator_is_used_by_worker() {
    let p = pipeline();
    let worker = Worker::new(
        p.requests.clone(),
        p.results.clone(),
        p.dead_letters.clone(),
        Arc::new(|expression: &str| Ok::<_, Error>(expression.len() as f64)),
        loop_config(5),
    );
    let id = p
        .submitter
        .submit(NewJob::new("abcd", "ada"))
        .await
        .unwrap();

    worker.poll_once().await.unwrap();
    p.completion.poll_once().await.unwrap();

    assert_eq!(p.store.get_job(id).await.unwrap().result, Some(4.0));
}

// ---------------------------------------------------------------------------
// Evaluation failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_expression_marks_job_failed() {
    let p = pipeline();
    let id = p
        .submitter
        .submit(NewJob::new("8 +* 12", "ada"))
        .await
        .unwrap();

    p.worker.poll_once().await.unwrap();
    let results = p.results.payloads().await;
    let item: ResultItem = serde_json::from_value(results[0].clone()).unwrap();
    assert_eq!(item.result, None);
    assert!(item.error.is_some());

    p.completion.poll_once().await.unwrap();
    let job = p.store.get_job(id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(job.result, None);
    assert!(job.error.is_some());
    assert!(job.failed.is_some());
    assert!(p.dead_letters.is_empty().await);
}

#[tokio::test]
async fn division_by_zero_marks_job_failed() {
    let p = pipeline();
    let id = p
        .submitter
        .submit(NewJob::new("1 / 0", "ada"))
        .await
        .unwrap();

    p.worker.poll_once().await.unwrap();
    p.completion.poll_once().await.unwrap();

    let job = p.store.get_job(id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.error.unwrap().contains("division by zero"));
}

// ---------------------------------------------------------------------------
// At-least-once delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_request_delivery_completes_job_once() {
    let p = pipeline();
    let id = p
        .submitter
        .submit(NewJob::new("8 + 12", "ada"))
        .await
        .unwrap();
    // Same request delivered twice, e.g. a worker crashed before acknowledging.
    let job = p.store.get_job(id).await.unwrap();
    publish(p.requests.as_ref(), &RequestItem::from(&job))
        .await
        .unwrap();

    assert_eq!(p.worker.poll_once().await.unwrap(), 2);
    assert_eq!(p.results.len().await, 2);

    assert_eq!(p.completion.poll_once().await.unwrap(), 2);
    assert!(p.results.is_empty().await);
    assert!(p.dead_letters.is_empty().await);

    let job = p.store.get_job(id).await.unwrap();
    assert_eq!(job.result, Some(20.0));
}

#[tokio::test]
async fn first_result_wins_over_later_duplicate() {
    let p = pipeline();
    let id = p
        .submitter
        .submit(NewJob::new("8 + 12", "ada"))
        .await
        .unwrap();

    publish(p.results.as_ref(), &ResultItem::success(id, 20.0))
        .await
        .unwrap();
    p.completion.poll_once().await.unwrap();
    let first = p.store.get_job(id).await.unwrap();

    publish(p.results.as_ref(), &ResultItem::success(id, 99.0))
        .await
        .unwrap();
    publish(p.results.as_ref(), &ResultItem::failure(id, "late failure"))
        .await
        .unwrap();
    p.completion.poll_once().await.unwrap();

    let job = p.store.get_job(id).await.unwrap();
    assert_eq!(job.result, Some(20.0));
    assert_eq!(job.completed, first.completed);
    assert_eq!(job.error, None);
    assert!(p.results.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_redelivered_mid_evaluation_still_completes() {
    let p = pipeline_with(Duration::from_millis(30), 5);
    // Outlives the visibility window.
    let slow = |expression: &str| {
        std::thread::sleep(Duration::from_millis(80));
        Arithmetic.evaluate(expression)
    };
    let worker = Worker::new(
        p.requests.clone(),
        p.results.clone(),
        p.dead_letters.clone(),
        Arc::new(slow),
        loop_config(5),
    );
    let id = p
        .submitter
        .submit(NewJob::new("8 + 12", "ada"))
        .await
        .unwrap();

    let running = tokio::spawn(async move { worker.poll_once().await });

    // A second consumer picks the request up while the first is computing.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let redelivered = p
        .requests
        .receive_batch(Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].read_count, 2);

    // The first consumer's acknowledgment is stale and tolerated.
    assert_eq!(running.await.unwrap().unwrap(), 1);
    assert_eq!(p.results.len().await, 1);

    // The redelivered copy is still owned by the second consumer.
    p.requests.acknowledge(&redelivered[0].handle).await.unwrap();
    assert!(p.requests.is_empty().await);

    assert_eq!(p.completion.poll_once().await.unwrap(), 1);
    assert_eq!(p.store.get_job(id).await.unwrap().result, Some(20.0));
    assert!(p.dead_letters.is_empty().await);
}

#[tokio::test]
async fn complete_job_twice_returns_first_record() {
    let store = MemoryJobStore::new();
    let id = store.create_job(NewJob::new("8 + 12", "ada")).await.unwrap();

    let first_at = chrono::Utc::now();
    let first = store.complete_job(id, 20.0, first_at).await.unwrap();
    let second = store
        .complete_job(id, 20.0, first_at + chrono::Duration::seconds(5))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.completed, Some(first_at));
}

#[tokio::test]
async fn store_rejects_unknown_job() {
    let store = MemoryJobStore::new();
    let err = store.get_job(JobId::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = store
        .complete_job(JobId::new(), 1.0, chrono::Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_request_is_dead_lettered() {
    let p = pipeline();
    p.requests
        .enqueue(&json!({"expression": "1 + 1"}))
        .await
        .unwrap();

    p.worker.poll_once().await.unwrap();

    assert!(p.requests.is_empty().await);
    assert!(p.results.is_empty().await);
    let letters = dead_letters(&p.dead_letters).await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].source, "math_queue");
    assert!(letters[0].reason.starts_with("malformed"), "{}", letters[0].reason);
    assert_eq!(letters[0].deliveries, 1);
    assert_eq!(letters[0].payload, json!({"expression": "1 + 1"}));
}

#[tokio::test]
async fn result_for_unknown_job_is_dead_lettered() {
    let p = pipeline();
    let stray = JobId::new();
    publish(p.results.as_ref(), &ResultItem::success(stray, 3.0))
        .await
        .unwrap();

    p.completion.poll_once().await.unwrap();

    assert!(p.results.is_empty().await);
    let letters = dead_letters(&p.dead_letters).await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].source, "math_result_queue");
    assert!(letters[0].reason.contains(&stray.to_string()));
}

#[tokio::test]
async fn result_without_outcome_is_dead_lettered() {
    let p = pipeline();
    let id = p
        .submitter
        .submit(NewJob::new("8 + 12", "ada"))
        .await
        .unwrap();
    p.results.enqueue(&json!({"id": id})).await.unwrap();

    p.completion.poll_once().await.unwrap();

    assert!(p.store.get_job(id).await.unwrap().is_pending());
    assert_eq!(dead_letters(&p.dead_letters).await.len(), 1);
}

#[tokio::test]
async fn item_over_delivery_limit_is_dead_lettered() {
    let p = pipeline_with(Duration::from_millis(30), 1);
    let id = p
        .submitter
        .submit(NewJob::new("8 + 12", "ada"))
        .await
        .unwrap();

    // A consumer takes the request and never acknowledges it.
    let lost = p.requests.receive_batch(Duration::from_millis(20)).await.unwrap();
    assert_eq!(lost.len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    p.worker.poll_once().await.unwrap();

    assert!(p.requests.is_empty().await);
    assert!(p.results.is_empty().await);
    let letters = dead_letters(&p.dead_letters).await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].deliveries, 2);
    assert!(letters[0].reason.starts_with("exceeded"));
    let request: RequestItem = serde_json::from_value(letters[0].payload.clone()).unwrap();
    assert_eq!(request.id, id);
    assert!(p.store.get_job(id).await.unwrap().is_pending());
}

// ---------------------------------------------------------------------------
// Orphans and reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_failure_leaves_orphaned_pending_job() {
    let p = pipeline();
    let submitter = Submitter::new(p.store.clone(), Arc::new(UnreachableQueue));

    let err = submitter
        .submit(NewJob::new("8 + 12", "ada"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Queue(_)));

    assert_eq!(p.store.len().await, 1);
    let orphans = p
        .store
        .pending_jobs(chrono::Utc::now() + chrono::Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(orphans.len(), 1);
    assert!(p.requests.is_empty().await);
}

#[tokio::test]
async fn reconcile_sweep_reenqueues_orphans() {
    let p = pipeline();
    let submitter = Submitter::new(p.store.clone(), Arc::new(UnreachableQueue));
    submitter
        .submit(NewJob::new("8 + 12", "ada"))
        .await
        .unwrap_err();
    let orphan = p
        .store
        .pending_jobs(chrono::Utc::now() + chrono::Duration::seconds(1), 1)
        .await
        .unwrap()
        .remove(0);

    let reconciler = Reconciler::new(p.store.clone(), p.requests.clone());
    // Too young to be considered orphaned.
    assert_eq!(reconciler.sweep(Duration::from_secs(3600)).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(reconciler.sweep(Duration::ZERO).await.unwrap(), 1);

    p.worker.poll_once().await.unwrap();
    p.completion.poll_once().await.unwrap();
    let job = p.store.get_job(orphan.id).await.unwrap();
    assert_eq!(job.result, Some(20.0));

    // Resolved jobs are no longer swept.
    assert_eq!(reconciler.sweep(Duration::ZERO).await.unwrap(), 0);
}

#[tokio::test]
async fn reconcile_sweep_honours_limit_oldest_first() {
    let p = pipeline();
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            p.store
                .create_job(NewJob::new(format!("{n}"), "ada"))
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let swept = Reconciler::new(p.store.clone(), p.requests.clone())
        .with_limit(2)
        .sweep(Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(swept, 2);

    let queued: Vec<JobId> = p
        .requests
        .payloads()
        .await
        .into_iter()
        .map(|v| serde_json::from_value::<RequestItem>(v).unwrap().id)
        .collect();
    assert_eq!(queued, ids[..2].to_vec());
}

// ---------------------------------------------------------------------------
// Running loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_loops_resolve_jobs_and_stop_on_shutdown() {
    let p = pipeline();
    let worker = p.worker.clone();
    let completion = p.completion.clone();
    let worker_task = tokio::spawn(async move { worker.run().await });
    let completion_task = tokio::spawn(async move { completion.run().await });

    let id = p
        .submitter
        .submit(NewJob::new("2 * (3+4)", "ada"))
        .await
        .unwrap();

    let job = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = p.store.get_job(id).await.unwrap();
            if !job.is_pending() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job was not resolved in time");
    assert_eq!(job.result, Some(14.0));

    p.worker.shutdown();
    p.completion.shutdown();
    worker_task.await.unwrap().unwrap();
    completion_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn worker_stops_on_unreachable_broker() {
    let p = pipeline();
    let worker = Worker::new(
        Arc::new(UnreachableQueue),
        p.results.clone(),
        p.dead_letters.clone(),
        Arc::new(Arithmetic),
        loop_config(5),
    );

    let err = worker.run().await.unwrap_err();
    assert!(matches!(err, Error::Queue(_)));
}

#[tokio::test]
async fn reconciler_run_stops_on_shutdown() {
    let p = pipeline();
    let reconciler = Reconciler::new(p.store.clone(), p.requests.clone());
    let running = reconciler.clone();
    let task = tokio::spawn(async move {
        running
            .run(Duration::from_millis(10), Duration::ZERO)
            .await
    });

    p.store.create_job(NewJob::new("1 + 1", "ada")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    reconciler.shutdown();

    task.await.unwrap().unwrap();
    assert!(!p.requests.is_empty().await);
}
