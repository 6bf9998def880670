mod common;

use async_trait::async_trait;
use common::*;
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stevedore_queue::{
    DatabaseBackend, JobEnvelope, JobError, JobId, JobOutcome, ManualClock, QueueBackend, QueueConfig,
    QueueManager, QueuedJob, Result, Worker, WorkerOptions,
};

/// Delegates to a real backend, but its first `outages` reservations fail
/// as if the database were unreachable.
struct FlakyBackend {
    inner: Arc<dyn QueueBackend>,
    outages: AtomicU32,
}

#[async_trait]
impl QueueBackend for FlakyBackend {
    fn connection_name(&self) -> &str {
        self.inner.connection_name()
    }

    fn default_queue(&self) -> &str {
        self.inner.default_queue()
    }

    async fn push(&self, job: &mut QueuedJob, delay: Duration) -> Result<JobId> {
        self.inner.push(job, delay).await
    }

    async fn reserve(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let down = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(JobError::Backend(sqlx::Error::PoolTimedOut));
        }
        self.inner.reserve(queue).await
    }

    async fn release(&self, job: &QueuedJob, delay: Duration) -> Result<()> {
        self.inner.release(job, delay).await
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn move_to_dead_letter(&self, job: &QueuedJob, error: &JobError) -> Result<()> {
        self.inner.move_to_dead_letter(job, error).await
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        self.inner.size(queue).await
    }

    async fn clear(&self, queue: &str) -> Result<u64> {
        self.inner.clear(queue).await
    }
}

async fn flaky_setup(
    outages: u32,
) -> (tempfile::TempDir, Arc<DatabaseBackend>, Arc<FlakyBackend>, Worker) {
    let clock = ManualClock::new(START);
    let (dir, backend) = sqlite_backend(&clock).await;
    let flaky = Arc::new(FlakyBackend {
        inner: backend.clone(),
        outages: AtomicU32::new(outages),
    });
    let manager = QueueManager::new(QueueConfig::default(), registry())
        .with_backend("sync", flaky.clone());
    (dir, backend, flaky, Worker::new(Arc::new(manager)))
}

async fn setup() -> (tempfile::TempDir, ManualClock, Arc<dyn QueueBackend>, Worker) {
    let clock = ManualClock::new(START);
    let (dir, backend) = sqlite_backend(&clock).await;
    let backend: Arc<dyn QueueBackend> = backend;
    let manager = QueueManager::new(QueueConfig::default(), registry())
        .with_backend("sync", Arc::clone(&backend));
    (dir, clock, backend, Worker::new(Arc::new(manager)))
}

fn options() -> WorkerOptions {
    WorkerOptions::new()
        .handle_signals(false)
        .sleep(Duration::from_millis(10))
        .backend_backoff(Duration::from_millis(10))
}

#[tokio::test]
async fn test_successful_job_is_deleted() {
    let (_dir, _clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(CountingJob::ok("worker-success"));
    backend.push(&mut job, Duration::ZERO).await.unwrap();

    assert!(worker.run_next_job(&options()).await.unwrap());
    assert_eq!(hits("worker-success"), 1);
    assert_eq!(backend.size("default").await.unwrap(), 0);

    // Nothing left
    assert!(!worker.run_next_job(&options()).await.unwrap());
}

#[tokio::test]
async fn test_failing_job_is_retried_until_max_tries() {
    let (_dir, clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(CountingJob::always_failing("worker-retry"));
    backend.push(&mut job, Duration::ZERO).await.unwrap();

    let mut reservations = 0;
    while worker.run_next_job(&options()).await.unwrap() {
        reservations += 1;
        // Released with the job's 90s retry_after
        assert!(!worker.run_next_job(&options()).await.unwrap());
        clock.advance(Duration::from_secs(90));
    }

    assert_eq!(reservations, 3);
    assert_eq!(hits("worker-retry"), 3);
    assert_eq!(hits("failed:worker-retry"), 1);
    assert_eq!(backend.size("default").await.unwrap(), 0);
    assert_eq!(backend.failed_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_worker_limit_above_job_limit_does_not_extend_retries() {
    let (_dir, clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(CountingJob::always_failing("worker-cap"));
    backend.push(&mut job, Duration::ZERO).await.unwrap();

    let opts = options().max_tries(5);
    let mut reservations = 0;
    while worker.run_next_job(&opts).await.unwrap() {
        reservations += 1;
        clock.advance(Duration::from_secs(90));
    }

    assert_eq!(reservations, 3);
    assert_eq!(hits("failed:worker-cap"), 1);
    assert_eq!(backend.failed_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_single_try_goes_straight_to_dead_letters() {
    let (_dir, _clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(ReportJob { report_id: 42 });
    backend.push(&mut job, Duration::ZERO).await.unwrap();

    let reserved = backend.reserve("default").await.unwrap().expect("job");
    assert_eq!(reserved.attempts(), 1);

    let outcome = worker
        .process(reserved, &options().max_tries(1))
        .await
        .unwrap();
    assert_eq!(outcome, JobOutcome::DeadLettered);
    assert_eq!(hits("report-failed:42"), 1);

    assert_eq!(backend.size("default").await.unwrap(), 0);
    let failed = backend.failed_jobs().await.unwrap();
    assert_eq!(failed.len(), 1);
    let envelope: JobEnvelope = serde_json::from_str(&failed[0].payload).unwrap();
    assert_eq!(envelope.data, serde_json::json!({ "report_id": 42 }));
    assert!(failed[0].exception.contains("report 42 could not be generated"));
}

#[tokio::test]
async fn test_failure_releases_with_backoff() {
    let (_dir, _clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(ReportJob { report_id: 7 });
    backend.push(&mut job, Duration::ZERO).await.unwrap();
    let reserved = backend.reserve("default").await.unwrap().expect("job");

    let outcome = worker.process(reserved, &options()).await.unwrap();
    assert_eq!(
        outcome,
        JobOutcome::Retrying {
            delay: Duration::from_secs(90)
        }
    );
    assert_eq!(backend.size("default").await.unwrap(), 1);
    assert!(backend.failed_jobs().await.unwrap().is_empty());
    assert_eq!(hits("report-failed:7"), 0);
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let (_dir, _clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(SlowJob {
        key: "worker-slow".into(),
    });
    backend.push(&mut job, Duration::ZERO).await.unwrap();
    let reserved = backend.reserve("default").await.unwrap().expect("job");

    let started = std::time::Instant::now();
    let outcome = worker
        .process(reserved, &options().timeout(Duration::from_millis(200)))
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Retrying { .. }));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(hits("worker-slow"), 0);
}

#[tokio::test]
async fn test_panicking_job_is_a_failure_not_a_crash() {
    let (_dir, _clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(PanickingJob {});
    backend.push(&mut job, Duration::ZERO).await.unwrap();
    let reserved = backend.reserve("default").await.unwrap().expect("job");

    let outcome = worker
        .process(reserved, &options().max_tries(1))
        .await
        .unwrap();
    assert_eq!(outcome, JobOutcome::DeadLettered);

    let failed = backend.failed_jobs().await.unwrap();
    assert!(failed[0].exception.contains("exploded mid-job"));
}

#[tokio::test]
async fn test_failed_hook_errors_are_swallowed() {
    let (_dir, _clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(BrokenHookJob {
        key: "worker-hook".into(),
    });
    backend.push(&mut job, Duration::ZERO).await.unwrap();

    assert!(worker.run_next_job(&options()).await.unwrap());
    assert_eq!(hits("worker-hook"), 1);
    assert_eq!(backend.failed_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_panicking_failed_hook_still_dead_letters() {
    let (_dir, _clock, backend, worker) = setup().await;

    let mut job = QueuedJob::new(PanickingHookJob {
        key: "worker-hook-panic".into(),
    });
    backend.push(&mut job, Duration::ZERO).await.unwrap();

    assert!(worker.run_next_job(&options()).await.unwrap());
    assert_eq!(hits("worker-hook-panic"), 1);
    assert_eq!(backend.failed_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_drains_queue_when_stop_when_empty() {
    let (_dir, _clock, backend, worker) = setup().await;

    for i in 0..5 {
        let mut job = QueuedJob::new(CountingJob::ok(&format!("drain-{}", i)));
        backend.push(&mut job, Duration::ZERO).await.unwrap();
    }

    let stats = worker.run(options().stop_when_empty()).await.unwrap();
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.succeeded, 5);
    assert_eq!(backend.size("default").await.unwrap(), 0);
    for i in 0..5 {
        assert_eq!(hits(&format!("drain-{}", i)), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loops_run_each_job_once() {
    let (_dir, _clock, backend, worker) = setup().await;

    for i in 0..20 {
        let mut job = QueuedJob::new(CountingJob::ok(&format!("pool-{}", i)));
        backend.push(&mut job, Duration::ZERO).await.unwrap();
    }

    let stats = worker
        .run(options().concurrency(4).stop_when_empty())
        .await
        .unwrap();
    assert_eq!(stats.succeeded, 20);
    for i in 0..20 {
        assert_eq!(hits(&format!("pool-{}", i)), 1, "pool-{} ran more than once", i);
    }
}

#[tokio::test]
async fn test_max_jobs_bounds_a_run() {
    let (_dir, _clock, backend, worker) = setup().await;

    for i in 0..5 {
        let mut job = QueuedJob::new(CountingJob::ok(&format!("budget-{}", i)));
        backend.push(&mut job, Duration::ZERO).await.unwrap();
    }

    let stats = worker.run(options().max_jobs(2)).await.unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(backend.size("default").await.unwrap(), 3);
}

#[tokio::test]
async fn test_stop_ends_an_idle_run() {
    let (_dir, _clock, _backend, worker) = setup().await;

    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(options().sleep(Duration::from_secs(60))).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.stop();
    assert!(worker.is_stopping());

    let stats = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn test_backend_outage_backs_off_and_keeps_polling() {
    let (_dir, backend, flaky, worker) = flaky_setup(2).await;

    let mut job = QueuedJob::new(CountingJob::ok("after-outage"));
    backend.push(&mut job, Duration::ZERO).await.unwrap();

    let stats = worker.run(options().stop_when_empty()).await.unwrap();

    // Failed polls are neither processed nor rejected
    assert_eq!(flaky.outages.load(Ordering::SeqCst), 0);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(stats.rejected, 0);
    assert_eq!(hits("after-outage"), 1);
    assert_eq!(backend.size("default").await.unwrap(), 0);
}

#[tokio::test]
async fn test_backend_outage_does_not_consume_an_attempt() {
    let (_dir, backend, _flaky, worker) = flaky_setup(1).await;

    let mut job = QueuedJob::new(CountingJob::ok("outage-single-shot"));
    backend.push(&mut job, Duration::ZERO).await.unwrap();

    let err = worker.run_next_job(&options()).await.unwrap_err();
    assert!(err.is_backend_error());
    assert_eq!(err.kind(), "QueueBackendError");
    assert_eq!(hits("outage-single-shot"), 0);

    let row: (i64,) = sqlx::query_as("SELECT attempts FROM jobs WHERE id = $1")
        .bind(job.id().unwrap().0)
        .fetch_one(backend.pool())
        .await
        .unwrap();
    assert_eq!(row.0, 0);

    assert!(worker.run_next_job(&options()).await.unwrap());
    assert_eq!(hits("outage-single-shot"), 1);
}

#[tokio::test]
async fn test_undecodable_payload_is_rejected_and_loop_continues() {
    let clock = ManualClock::new(START);
    let (_dir, backend) = sqlite_backend(&clock).await;
    insert_raw(&backend, "default", r#"{"class":"nope","data":{}}"#).await;
    let mut good = QueuedJob::new(CountingJob::ok("after-reject"));
    backend.push(&mut good, Duration::ZERO).await.unwrap();

    let manager = QueueManager::new(QueueConfig::default(), registry())
        .with_backend("sync", backend.clone());
    let worker = Worker::new(Arc::new(manager));

    let stats = worker.run(options().stop_when_empty()).await.unwrap();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(hits("after-reject"), 1);
    assert_eq!(backend.failed_jobs().await.unwrap().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    /// An always-failing job is reserved min(worker limit, job limit) times,
    /// then dead-lettered once
    #[test]
    fn prop_retry_bound(max_tries in 1u32..7, case in 0u64..u64::MAX) {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let (_dir, clock, backend, worker) = setup().await;
            let key = format!("prop-retry-{}-{}", max_tries, case);

            let mut job = QueuedJob::new(CountingJob::always_failing(&key));
            backend.push(&mut job, Duration::ZERO).await.unwrap();

            let opts = options().max_tries(max_tries);
            let mut reservations = 0;
            while worker.run_next_job(&opts).await.unwrap() {
                reservations += 1;
                clock.advance(Duration::from_secs(90));
            }

            let expected = max_tries.min(3);
            prop_assert_eq!(reservations, expected);
            prop_assert_eq!(hits(&key), expected);
            prop_assert_eq!(backend.size("default").await.unwrap(), 0);
            prop_assert_eq!(backend.failed_jobs().await.unwrap().len(), 1);
            Ok(())
        })?;
    }

    /// Sequential reservations return jobs in push order
    #[test]
    fn prop_fifo_order(count in 1usize..8) {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let (_dir, _clock, backend, _worker) = setup().await;

            let mut pushed = Vec::new();
            for i in 0..count {
                let mut job = QueuedJob::new(CountingJob::ok(&format!("prop-fifo-{}", i)));
                pushed.push(backend.push(&mut job, Duration::ZERO).await.unwrap());
            }

            let mut reserved = Vec::new();
            while let Some(job) = backend.reserve("default").await.unwrap() {
                reserved.push(job.id().unwrap());
            }

            prop_assert_eq!(reserved, pushed);
            Ok(())
        })?;
    }
}
