use crate::error::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Queue used when neither the job nor the caller names one.
pub const DEFAULT_QUEUE: &str = "default";

/// Identifier assigned by a backend when a job is enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Context passed to job execution
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Option<JobId>,
    pub attempt: u32,
    pub queue: String,
    pub connection: String,
}

/// A unit of deferred work.
///
/// The serialized fields of the implementing type are the job's payload and
/// `NAME` is the type tag a [`JobRegistry`](crate::JobRegistry) resolves it by.
/// Execution may happen more than once for the same payload, so `handle`
/// should be idempotent.
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The job name/type
    const NAME: &'static str;

    /// Queue to push onto. `None` uses the connection's default queue.
    fn queue(&self) -> Option<&str> {
        None
    }

    fn max_tries(&self) -> u32 {
        3
    }

    /// Wall-clock budget for one `handle` call.
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Minimum time before a released job becomes eligible again.
    fn retry_after(&self) -> Duration {
        Duration::from_secs(90)
    }

    /// Delay applied when releasing after the given (1-based) failed attempt.
    fn backoff(&self, _attempt: u32) -> Duration {
        self.retry_after()
    }

    fn display_name(&self) -> String {
        Self::NAME.to_string()
    }

    /// Execute the job
    async fn handle(&self, ctx: JobContext) -> Result<()>;

    /// Called once when the job is abandoned. Errors are logged, never propagated.
    async fn failed(&self, _ctx: JobContext, _error: &crate::JobError) -> Result<()> {
        Ok(())
    }
}

/// Self-describing wire format of a stored job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub class: String,
    pub data: serde_json::Value,
}

impl JobEnvelope {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A type-erased job
#[async_trait]
pub trait DynJob: Send + Sync {
    fn name(&self) -> &'static str;
    fn envelope(&self) -> Result<JobEnvelope>;
    fn queue(&self) -> Option<&str>;
    fn max_tries(&self) -> u32;
    fn timeout(&self) -> Duration;
    fn retry_after(&self) -> Duration;
    fn backoff(&self, attempt: u32) -> Duration;
    fn display_name(&self) -> String;
    fn as_any(&self) -> &dyn Any;
    async fn handle(&self, ctx: JobContext) -> Result<()>;
    async fn failed(&self, ctx: JobContext, error: &crate::JobError) -> Result<()>;
}

#[async_trait]
impl<J: Job> DynJob for J {
    fn name(&self) -> &'static str {
        J::NAME
    }

    fn envelope(&self) -> Result<JobEnvelope> {
        Ok(JobEnvelope {
            class: J::NAME.to_string(),
            data: serde_json::to_value(self)?,
        })
    }

    fn queue(&self) -> Option<&str> {
        Job::queue(self)
    }

    fn max_tries(&self) -> u32 {
        Job::max_tries(self)
    }

    fn timeout(&self) -> Duration {
        Job::timeout(self)
    }

    fn retry_after(&self) -> Duration {
        Job::retry_after(self)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Job::backoff(self, attempt)
    }

    fn display_name(&self) -> String {
        Job::display_name(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn handle(&self, ctx: JobContext) -> Result<()> {
        Job::handle(self, ctx).await
    }

    async fn failed(&self, ctx: JobContext, error: &crate::JobError) -> Result<()> {
        Job::failed(self, ctx, error).await
    }
}

/// A job together with the runtime state its backend tracks.
///
/// `id` and `attempts` are only ever written by backends.
#[derive(Clone)]
pub struct QueuedJob {
    id: Option<JobId>,
    attempts: u32,
    queue: Option<String>,
    job: Arc<dyn DynJob>,
}

impl QueuedJob {
    pub fn new<J: Job>(job: J) -> Self {
        Self::from_dyn(Arc::new(job))
    }

    pub(crate) fn from_dyn(job: Arc<dyn DynJob>) -> Self {
        let queue = job.queue().map(str::to_string);
        Self {
            id: None,
            attempts: 0,
            queue,
            job,
        }
    }

    /// Override the queue the job is pushed onto.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    /// Number of times the job has been reserved
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    pub fn display_name(&self) -> String {
        self.job.display_name()
    }

    pub fn max_tries(&self) -> u32 {
        self.job.max_tries()
    }

    pub fn timeout(&self) -> Duration {
        self.job.timeout()
    }

    pub fn retry_after(&self) -> Duration {
        self.job.retry_after()
    }

    pub fn backoff(&self) -> Duration {
        self.job.backoff(self.attempts)
    }

    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_tries()
    }

    /// The encoded envelope stored in the `payload` column
    pub fn payload(&self) -> Result<String> {
        self.job.envelope()?.encode()
    }

    pub fn downcast_ref<J: Job>(&self) -> Option<&J> {
        self.job.as_any().downcast_ref::<J>()
    }

    pub(crate) fn inner(&self) -> Arc<dyn DynJob> {
        Arc::clone(&self.job)
    }

    pub(crate) fn set_id(&mut self, id: JobId) {
        self.id = Some(id);
    }

    pub(crate) fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
    }

    pub(crate) fn context(&self, queue: &str, connection: &str) -> JobContext {
        JobContext {
            job_id: self.id,
            attempt: self.attempts,
            queue: queue.to_string(),
            connection: connection.to_string(),
        }
    }
}

impl<J: Job> From<J> for QueuedJob {
    fn from(job: J) -> Self {
        Self::new(job)
    }
}

impl fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedJob")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("attempts", &self.attempts)
            .field("queue", &self.queue)
            .finish()
    }
}
