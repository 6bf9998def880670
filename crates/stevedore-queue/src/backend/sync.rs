use super::QueueBackend;
use crate::error::{JobError, Result};
use crate::job::{JobId, QueuedJob, DEFAULT_QUEUE};
use crate::worker::panic_message;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Backend that runs every job inline at push time (not persistent, for testing/dev).
///
/// A failing job gets its `failed` hook and the error is returned to the
/// caller. Nothing is ever stored, so `reserve` finds nothing and `size` is 0.
#[derive(Debug)]
pub struct SyncBackend {
    connection: String,
    next_id: AtomicI64,
}

impl SyncBackend {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for SyncBackend {
    fn default() -> Self {
        Self::new("sync")
    }
}

#[async_trait]
impl QueueBackend for SyncBackend {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn default_queue(&self) -> &str {
        DEFAULT_QUEUE
    }

    async fn push(&self, job: &mut QueuedJob, delay: Duration) -> Result<JobId> {
        if !delay.is_zero() {
            tracing::debug!(job = job.name(), delay_secs = delay.as_secs(), "Sync connection ignores delay");
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        job.set_id(id);
        job.set_attempts(1);

        let queue = job.queue().unwrap_or(DEFAULT_QUEUE).to_string();
        let ctx = job.context(&queue, &self.connection);
        let inner = job.inner();

        match inner.handle(ctx.clone()).await {
            Ok(()) => {
                tracing::debug!(job_id = %id, job = job.name(), "Ran job inline");
                Ok(id)
            }
            Err(err) => {
                match AssertUnwindSafe(inner.failed(ctx, &err)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(hook_err)) => {
                        tracing::warn!(job_id = %id, job = job.name(), error = %hook_err, "Failed hook raised an error");
                    }
                    Err(panic) => {
                        tracing::warn!(job_id = %id, job = job.name(), panic = %panic_message(&*panic), "Failed hook panicked");
                    }
                }
                Err(err)
            }
        }
    }

    async fn reserve(&self, _queue: &str) -> Result<Option<QueuedJob>> {
        Ok(None)
    }

    async fn release(&self, job: &QueuedJob, _delay: Duration) -> Result<()> {
        match job.id() {
            Some(id) => Err(JobError::JobNotFound(id)),
            None => Err(JobError::NotEnqueued(job.display_name())),
        }
    }

    async fn delete(&self, _id: JobId) -> Result<bool> {
        Ok(false)
    }

    async fn move_to_dead_letter(&self, job: &QueuedJob, error: &JobError) -> Result<()> {
        tracing::debug!(job = job.name(), error = %error, "Sync connection keeps no dead letters");
        Ok(())
    }

    async fn size(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }

    async fn clear(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }
}
