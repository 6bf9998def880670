use crate::job::JobId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage failure. The reservation or mutation that hit it did not commit.
    #[error("Backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {0} has not been pushed to a queue")]
    NotEnqueued(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// Raised from a job's `handle`.
    #[error("Job execution failed: {0}")]
    Execution(String),

    #[error("Job {job} exceeded its timeout of {}s", timeout.as_secs())]
    Timeout { job: String, timeout: Duration },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobError {
    /// Build an execution failure from anything printable.
    pub fn execution(message: impl std::fmt::Display) -> Self {
        Self::Execution(message.to_string())
    }

    /// True for failures that retrying the same payload can never fix.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, Self::UnknownJobType(_) | Self::InvalidPayload(_))
    }

    /// True for storage-layer failures, which workers treat as transient.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serialization(_) => "SerializationError",
            Self::Backend(_) => "QueueBackendError",
            Self::JobNotFound(_) => "JobNotFoundError",
            Self::NotEnqueued(_) => "NotEnqueuedError",
            Self::UnknownJobType(_) => "UnknownJobTypeError",
            Self::InvalidPayload(_) => "InvalidJobPayloadError",
            Self::Execution(_) => "JobExecutionError",
            Self::Timeout { .. } => "JobTimeoutError",
            Self::Config(_) => "ConfigError",
        }
    }

    /// Text stored in the dead-letter `exception` column.
    pub fn report(&self) -> String {
        let mut out = format!("{}: {}", self.kind(), self);
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
