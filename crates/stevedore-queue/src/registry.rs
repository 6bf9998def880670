//! Allow-list of job kinds a backend may instantiate from stored payloads.

use crate::error::{JobError, Result};
use crate::job::{DynJob, Job, JobEnvelope, QueuedJob};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Factory = fn(serde_json::Value) -> Result<Arc<dyn DynJob>>;

fn build<J: Job>(data: serde_json::Value) -> Result<Arc<dyn DynJob>> {
    let job: J = serde_json::from_value(data)
        .map_err(|e| JobError::InvalidPayload(format!("{}: {}", J::NAME, e)))?;
    Ok(Arc::new(job))
}

/// Maps type tags to constructors for the job kinds a process accepts.
///
/// Decoding never resolves a tag that was not registered here, so an
/// untrusted payload can only ever produce one of these types.
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job kind under its `NAME`
    pub fn register<J: Job>(&mut self) -> &mut Self {
        if self.factories.insert(J::NAME, build::<J>).is_some() {
            tracing::warn!(job = J::NAME, "Job type registered twice");
        }
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<J: Job>(mut self) -> Self {
        self.register::<J>();
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Decode a stored payload into a job.
    ///
    /// Fails with `UnknownJobType` before any construction when the tag is not
    /// registered, and with `InvalidPayload` when the envelope or fields are
    /// malformed.
    pub fn deserialize(&self, payload: &str) -> Result<QueuedJob> {
        let envelope: JobEnvelope = serde_json::from_str(payload)
            .map_err(|e| JobError::InvalidPayload(format!("malformed envelope: {}", e)))?;

        let factory = self
            .factories
            .get(envelope.class.as_str())
            .ok_or_else(|| JobError::UnknownJobType(envelope.class.clone()))?;

        if !envelope.data.is_object() {
            return Err(JobError::InvalidPayload(format!(
                "{}: data must be an object",
                envelope.class
            )));
        }

        Ok(QueuedJob::from_dyn(factory(envelope.data)?))
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}
