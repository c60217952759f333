use chrono::Utc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::job::document::JobId;
use crate::job::registry::JobError;
use crate::store::QueueStore;

/// Handle passed to a running job for progress reporting and deferral.
pub struct JobContext<'a> {
    store: &'a QueueStore,
    job_id: JobId,
    progress_interval: Duration,
    last_progress: Option<Instant>,
}

impl<'a> JobContext<'a> {
    pub fn new(store: &'a QueueStore, job_id: JobId, progress_interval_secs: u64) -> Self {
        Self {
            store,
            job_id,
            progress_interval: Duration::from_secs(progress_interval_secs),
            last_progress: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Reports progress, at most once per `progress_interval`.
    ///
    /// Returns whether the update was written.
    pub fn progress(&mut self, value: f64, message: impl Into<String>) -> Result<bool> {
        if let Some(last) = self.last_progress {
            if last.elapsed() < self.progress_interval {
                return Ok(false);
            }
        }
        self.force_progress(value, message)?;
        Ok(true)
    }

    /// Reports progress regardless of the rate limit.
    pub fn force_progress(&mut self, value: f64, message: impl Into<String>) -> Result<()> {
        let value = value.clamp(0.0, 1.0);
        let message = message.into();
        tracing::debug!(job_id = %self.job_id, value, message = %message, "Job progress");
        self.store
            .progress(self.job_id, value, Some(&message), Utc::now())?;
        self.last_progress = Some(Instant::now());
        Ok(())
    }

    /// Signal used as `return Err(ctx.defer("waiting for input"))`.
    pub fn defer(&self, message: impl Into<String>) -> JobError {
        JobError::Deferred(message.into())
    }
}
