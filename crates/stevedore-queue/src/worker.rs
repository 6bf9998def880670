//! Queue consumer.
//!
//! A [`Worker`] polls one queue on one connection, runs what it reserves and
//! settles each job as succeeded (deleted), retrying (released with a delay)
//! or dead-lettered. Stopping is cooperative: the flag is checked between
//! jobs and wakes an idle sleep, but never interrupts a running `handle`.

use crate::backend::QueueBackend;
use crate::error::{JobError, Result};
use crate::job::{JobContext, QueuedJob};
use crate::manager::QueueManager;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Options for a worker run
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Connection to poll. `None` uses the manager's default.
    pub connection: Option<String>,
    /// Queue to poll. `None` uses the connection's default queue.
    pub queue: Option<String>,
    /// Idle time between polls that found nothing
    pub sleep: Duration,
    /// Caps each job's own `max_tries`. It can lower the limit, never raise it.
    pub max_tries: Option<u32>,
    /// Overrides each job's own timeout. Zero disables the deadline.
    pub timeout: Option<Duration>,
    /// Stop after this many reserved jobs
    pub max_jobs: Option<u64>,
    pub stop_when_empty: bool,
    /// Number of reserve/process loops run side by side
    pub concurrency: usize,
    /// Pause after a storage error before polling again
    pub backend_backoff: Duration,
    /// Stop on SIGINT / SIGTERM
    pub handle_signals: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            connection: None,
            queue: None,
            sleep: Duration::from_secs(3),
            max_tries: None,
            timeout: None,
            max_jobs: None,
            stop_when_empty: false,
            concurrency: 1,
            backend_backoff: Duration::from_secs(1),
            handle_signals: true,
        }
    }
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(mut self, name: impl Into<String>) -> Self {
        self.connection = Some(name.into());
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn max_tries(mut self, n: u32) -> Self {
        self.max_tries = Some(n);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_jobs(mut self, n: u64) -> Self {
        self.max_jobs = Some(n);
        self
    }

    pub fn stop_when_empty(mut self) -> Self {
        self.stop_when_empty = true;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn backend_backoff(mut self, pause: Duration) -> Self {
        self.backend_backoff = pause;
        self
    }

    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }
}

/// How a processed job was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Retrying { delay: Duration },
    DeadLettered,
}

/// Totals for one [`Worker::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Reservations whose payload could not be decoded
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: JobOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            JobOutcome::Succeeded => &self.succeeded,
            JobOutcome::Retrying { .. } => &self.retried,
            JobOutcome::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Reservation allowance shared by the loops of one run
struct JobBudget {
    limit: Option<u64>,
    claimed: AtomicU64,
}

impl JobBudget {
    fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            claimed: AtomicU64::new(0),
        }
    }

    fn try_claim(&self) -> bool {
        match self.limit {
            None => true,
            Some(limit) => self
                .claimed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < limit).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    fn refund(&self) {
        if self.limit.is_some() {
            self.claimed.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Queue consumer. Clones share the same stop flag.
#[derive(Clone)]
pub struct Worker {
    manager: Arc<QueueManager>,
    stop: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub fn new(manager: Arc<QueueManager>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            manager,
            stop: Arc::new(stop),
        }
    }

    /// Ask every loop to exit once its current job is settled
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Poll until stopped, the job budget is spent, or (with
    /// `stop_when_empty`) the queue has nothing eligible.
    pub async fn run(&self, options: WorkerOptions) -> Result<WorkerStats> {
        let backend = self
            .manager
            .connection(options.connection.as_deref())
            .await?;
        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| backend.default_queue().to_string());
        let signals = options.handle_signals.then(|| self.listen_for_signals());

        let counters = Arc::new(Counters::default());
        let budget = Arc::new(JobBudget::new(options.max_jobs));
        let concurrency = options.concurrency.max(1);

        tracing::info!(
            connection = backend.connection_name(),
            queue = %queue,
            concurrency,
            "Worker started"
        );

        let loops: Vec<JoinHandle<()>> = (0..concurrency)
            .map(|slot| {
                let worker = self.clone();
                let backend = Arc::clone(&backend);
                let queue = queue.clone();
                let options = options.clone();
                let counters = Arc::clone(&counters);
                let budget = Arc::clone(&budget);
                tokio::spawn(async move {
                    worker
                        .poll(slot, backend, &queue, &options, &counters, &budget)
                        .await
                })
            })
            .collect();

        for (slot, joined) in futures_util::future::join_all(loops).await.into_iter().enumerate() {
            if let Err(e) = joined {
                tracing::error!(slot, error = %e, "Worker loop panicked");
            }
        }

        if let Some(signals) = signals {
            signals.abort();
        }

        let stats = counters.snapshot();
        tracing::info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            "Worker stopped"
        );
        Ok(stats)
    }

    async fn poll(
        &self,
        slot: usize,
        backend: Arc<dyn QueueBackend>,
        queue: &str,
        options: &WorkerOptions,
        counters: &Counters,
        budget: &JobBudget,
    ) {
        loop {
            if self.is_stopping() || !budget.try_claim() {
                break;
            }

            match backend.reserve(queue).await {
                Ok(Some(job)) => match self.settle(backend.as_ref(), job, options).await {
                    Ok(outcome) => counters.record(outcome),
                    Err(err) => {
                        tracing::error!(slot, error = %err, "Could not settle job");
                        self.idle(options.backend_backoff).await;
                    }
                },
                Ok(None) => {
                    budget.refund();
                    if options.stop_when_empty {
                        break;
                    }
                    tracing::trace!(slot, queue, "No eligible job");
                    self.idle(options.sleep).await;
                }
                Err(err) if err.is_payload_error() => {
                    budget.refund();
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(slot, queue, error = %err, "Rejected undecodable job");
                }
                Err(err) => {
                    budget.refund();
                    tracing::error!(slot, queue, error = %err, "Queue backend error; backing off");
                    self.idle(options.backend_backoff).await;
                }
            }
        }
    }

    /// Reserve and process at most one job. Returns whether a job was found.
    pub async fn run_next_job(&self, options: &WorkerOptions) -> Result<bool> {
        let backend = self
            .manager
            .connection(options.connection.as_deref())
            .await?;
        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| backend.default_queue().to_string());

        match backend.reserve(&queue).await? {
            Some(job) => {
                self.settle(backend.as_ref(), job, options).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run a reserved job and settle it on its connection
    pub async fn process(&self, job: QueuedJob, options: &WorkerOptions) -> Result<JobOutcome> {
        let backend = self
            .manager
            .connection(options.connection.as_deref())
            .await?;
        self.settle(backend.as_ref(), job, options).await
    }

    async fn settle(
        &self,
        backend: &dyn QueueBackend,
        job: QueuedJob,
        options: &WorkerOptions,
    ) -> Result<JobOutcome> {
        let id = job
            .id()
            .ok_or_else(|| JobError::NotEnqueued(job.display_name()))?;
        let name = job.display_name();
        let max_tries = effective_max_tries(options.max_tries, job.max_tries());
        let timeout = options.timeout.unwrap_or_else(|| job.timeout());
        let queue = job
            .queue()
            .unwrap_or(backend.default_queue())
            .to_string();
        let ctx = job.context(&queue, backend.connection_name());

        tracing::debug!(job_id = %id, job = %name, attempt = job.attempts(), "Processing job");

        let error = match execute(&job, ctx.clone(), timeout).await {
            Ok(()) => {
                if !backend.delete(id).await? {
                    tracing::warn!(job_id = %id, job = %name, "Job row was already gone after success");
                }
                tracing::info!(job_id = %id, job = %name, attempt = job.attempts(), "Job succeeded");
                return Ok(JobOutcome::Succeeded);
            }
            Err(error) => error,
        };

        if job.attempts() < max_tries {
            let delay = job.backoff();
            match backend.release(&job, delay).await {
                Ok(()) => {}
                Err(JobError::JobNotFound(_)) => {
                    tracing::warn!(job_id = %id, job = %name, "Job row vanished before release");
                }
                Err(e) => return Err(e),
            }
            tracing::warn!(
                job_id = %id,
                job = %name,
                attempt = job.attempts(),
                max_tries,
                retry_in_secs = delay.as_secs(),
                error = %error,
                "Job failed; released for retry"
            );
            return Ok(JobOutcome::Retrying { delay });
        }

        match AssertUnwindSafe(job.inner().failed(ctx, &error))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(hook_err)) => {
                tracing::warn!(job_id = %id, job = %name, error = %hook_err, "Failed hook raised an error");
            }
            Err(panic) => {
                tracing::warn!(job_id = %id, job = %name, panic = %panic_message(&*panic), "Failed hook panicked");
            }
        }

        backend.move_to_dead_letter(&job, &error).await?;
        tracing::error!(
            job_id = %id,
            job = %name,
            attempts = job.attempts(),
            error = %error,
            "Job failed permanently; moved to dead letters"
        );
        Ok(JobOutcome::DeadLettered)
    }

    async fn idle(&self, duration: Duration) {
        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = stop.changed() => {}
        }
    }

    fn listen_for_signals(&self) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received; finishing in-flight jobs");
            worker.stop();
        })
    }
}

/// Run `handle` on its own task under a deadline.
///
/// When the deadline passes the task is aborted, which takes effect at its
/// next `.await`. A job stuck in blocking code keeps running on its thread
/// until it returns, even though the attempt has already been counted as
/// failed.
async fn execute(job: &QueuedJob, ctx: JobContext, timeout: Duration) -> Result<()> {
    let inner = job.inner();
    let mut task = tokio::spawn(async move { inner.handle(ctx).await });

    let joined = if timeout.is_zero() {
        task.await
    } else {
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(JobError::Timeout {
                    job: job.display_name(),
                    timeout,
                });
            }
        }
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            Err(JobError::execution(format!(
                "job panicked: {}",
                panic_message(&*panic)
            )))
        }
        Err(e) => Err(JobError::execution(e)),
    }
}

/// A worker-level limit can only shorten a job's retries
fn effective_max_tries(cap: Option<u32>, own: u32) -> u32 {
    cap.map_or(own, |cap| cap.min(own))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
