use crate::error::{JobError, Result};
use crate::job::{JobId, QueuedJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod database;
pub mod sync;

/// A dead-lettered job as stored for inspection and manual replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub uuid: String,
    pub connection: String,
    pub queue: String,
    pub payload: String,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

/// Storage and reservation engine behind a named connection
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Name of the connection this backend was configured under
    fn connection_name(&self) -> &str;

    /// Queue used when a job does not name one
    fn default_queue(&self) -> &str;

    /// Create whatever storage the backend needs
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Push a job, eligible after `delay`. Sets the id on `job` and returns it.
    async fn push(&self, job: &mut QueuedJob, delay: Duration) -> Result<JobId>;

    /// Lease the oldest eligible job on `queue`, incrementing its attempts.
    /// Returns `None` if nothing is eligible.
    async fn reserve(&self, queue: &str) -> Result<Option<QueuedJob>>;

    /// Drop the lease and make the job eligible again after `delay`.
    /// Fails with `JobNotFound` if the row is gone.
    async fn release(&self, job: &QueuedJob, delay: Duration) -> Result<()>;

    /// Remove a finished job. Returns false if it no longer existed.
    async fn delete(&self, id: JobId) -> Result<bool>;

    /// Record the job in the dead-letter store and remove it from the queue
    async fn move_to_dead_letter(&self, job: &QueuedJob, error: &JobError) -> Result<()>;

    /// Number of rows on `queue`, in any state
    async fn size(&self, queue: &str) -> Result<u64>;

    /// Delete every job on `queue`, returning how many were removed
    async fn clear(&self, queue: &str) -> Result<u64>;

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>> {
        Ok(Vec::new())
    }

    /// Put a dead-lettered job back on its queue with a fresh attempt budget
    async fn retry_failed(&self, _uuid: &str) -> Result<Option<JobId>> {
        Ok(None)
    }

    async fn forget_failed(&self, _uuid: &str) -> Result<bool> {
        Ok(false)
    }

    async fn flush_failed(&self) -> Result<u64> {
        Ok(0)
    }
}
