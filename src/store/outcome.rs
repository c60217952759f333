//! State transitions reported by workers and job processes.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use super::stat::{record_stat, StatEvent};
use super::{require_doc, retire_doc, save_doc, QueueStore};
use crate::error::{QueueError, Result};
use crate::job::{JobDocument, JobId, JobState, LastError, LockInfo};

// a century, keeps timestamp arithmetic in range
const MAX_SECS: u64 = 100 * 365 * 24 * 3600;

fn secs(s: u64) -> Duration {
    Duration::seconds(s.min(MAX_SECS) as i64)
}

/// Adds the elapsed time since `started_at` to the cumulative runtime.
fn close_run(doc: &mut JobDocument, now: DateTime<Utc>) {
    if let Some(started) = doc.started_at {
        let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
        doc.runtime += elapsed;
    }
    doc.finished_at = Some(now);
    doc.locked = None;
}

fn unlock(conn: &Connection, id: JobId) -> Result<()> {
    conn.execute("DELETE FROM lock WHERE id = ?1", rusqlite::params![id.0])?;
    Ok(())
}

fn check_eligible(doc: &JobDocument, now: DateTime<Utc>) -> Result<()> {
    let reason = if doc.removed_at.is_some() {
        "is flagged for removal"
    } else if doc.killed_at.is_some() {
        "is flagged to be killed"
    } else if doc.attempts_left == 0 {
        "has no attempts left"
    } else if doc.query_at.map(|at| at > now).unwrap_or(false) {
        "is not due yet"
    } else {
        return Ok(());
    };
    Err(QueueError::conflict(format!("job [{}] {}", doc.id, reason)))
}

/// Worker attributes written into `locked` when a job starts.
#[derive(Debug, Clone)]
pub struct RunningBy<'a> {
    pub worker: &'a str,
    pub hostname: &'a str,
}

impl QueueStore {
    /// Moves a dispatchable job to running on behalf of `by`.
    ///
    /// Eligibility is checked again under the write lock: a job that was
    /// flagged, ran out of attempts or is not due yet since it was selected
    /// fails with `Conflict`.
    pub fn mark_running(&self, id: JobId, by: RunningBy<'_>, now: DateTime<Utc>) -> Result<JobDocument> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            check_eligible(&doc, now)?;
            doc.transition(JobState::Running)?;
            doc.started_at = Some(now);
            doc.finished_at = None;
            doc.query_at = None;
            doc.trial += 1;
            doc.locked = Some(LockInfo {
                worker: by.worker.to_string(),
                hostname: by.hostname.to_string(),
                pid: None,
                at: now,
                heartbeat: now,
                progress: None,
                progress_value: None,
            });
            if doc.inactive_at.is_none() {
                doc.inactive_at = Some(now + secs(doc.defer_max));
            }
            save_doc(tx, &doc)?;
            Ok(doc)
        })
    }

    pub fn set_pid(&self, id: JobId, pid: u32) -> Result<()> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            if let Some(locked) = doc.locked.as_mut() {
                locked.pid = Some(pid);
            }
            save_doc(tx, &doc)
        })
    }

    /// Refreshes the heartbeat of a running job without progress.
    pub fn heartbeat(&self, id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            if let Some(locked) = doc.locked.as_mut() {
                locked.heartbeat = now;
            }
            save_doc(tx, &doc)
        })
    }

    pub fn progress(&self, id: JobId, value: f64, message: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            if let Some(locked) = doc.locked.as_mut() {
                locked.heartbeat = now;
                locked.progress_value = Some(value);
                if let Some(message) = message {
                    locked.progress = Some(message.to_string());
                }
            }
            save_doc(tx, &doc)
        })
    }

    /// running → complete. The job is journaled and leaves the live store.
    pub fn set_complete(&self, id: JobId, now: DateTime<Utc>) -> Result<JobDocument> {
        let doc = self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            doc.transition(JobState::Complete)?;
            close_run(&mut doc, now);
            retire_doc(tx, &doc, now)?;
            record_stat(tx, StatEvent::CompleteJob, id, now)?;
            Ok(doc)
        })?;
        tracing::info!(job_id = %id, name = %doc.name, runtime = doc.runtime, "Job complete");
        Ok(doc)
    }

    /// running → deferred, or inactive once `inactive_at` has passed.
    ///
    /// `attempts_left` is unchanged.
    pub fn set_deferred(&self, id: JobId, message: &str, now: DateTime<Utc>) -> Result<JobState> {
        let state = self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            doc.last_error = Some(LastError::new(format!("JobDeferred: {}", message), now));
            if doc.inactive_at.map(|at| now >= at).unwrap_or(false) {
                doc.transition(JobState::Inactive)?;
                close_run(&mut doc, now);
                retire_doc(tx, &doc, now)?;
                record_stat(tx, StatEvent::InactivateJob, id, now)?;
            } else {
                doc.transition(JobState::Deferred)?;
                close_run(&mut doc, now);
                doc.query_at = Some(now + secs(doc.defer_time));
                save_doc(tx, &doc)?;
                unlock(tx, id)?;
                record_stat(tx, StatEvent::DeferJob, id, now)?;
            }
            Ok(doc.state)
        })?;
        tracing::info!(job_id = %id, state = %state, message, "Job deferred");
        Ok(state)
    }

    /// running → failed while attempts remain, otherwise error.
    pub fn set_failed(&self, id: JobId, error: LastError, now: DateTime<Utc>) -> Result<JobState> {
        let state = self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            doc.attempts_left = doc.attempts_left.saturating_sub(1);
            let next = if doc.attempts_left > 0 {
                JobState::Failed
            } else {
                JobState::Error
            };
            doc.transition(next)?;
            close_run(&mut doc, now);
            if next == JobState::Failed {
                doc.query_at = Some(now + secs(doc.error_time));
            }
            doc.last_error = Some(error);
            save_doc(tx, &doc)?;
            unlock(tx, id)?;
            record_stat(tx, StatEvent::FailedJob, id, now)?;
            Ok(next)
        })?;
        tracing::warn!(job_id = %id, state = %state, "Job failed");
        Ok(state)
    }

    /// running → error without retry bookkeeping.
    pub fn set_error(&self, id: JobId, error: LastError, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            doc.transition(JobState::Error)?;
            close_run(&mut doc, now);
            doc.last_error = Some(error);
            save_doc(tx, &doc)?;
            unlock(tx, id)?;
            record_stat(tx, StatEvent::FailedJob, id, now)
        })?;
        tracing::error!(job_id = %id, "Job error");
        Ok(())
    }

    /// running → inactive. The job is journaled and leaves the live store.
    pub fn set_inactive(&self, id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            doc.transition(JobState::Inactive)?;
            close_run(&mut doc, now);
            retire_doc(tx, &doc, now)?;
            record_stat(tx, StatEvent::InactivateJob, id, now)
        })?;
        tracing::warn!(job_id = %id, "Job inactive");
        Ok(())
    }

    /// running → killed. The job stays live until removed or restarted.
    pub fn set_killed(&self, id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            doc.transition(JobState::Killed)?;
            close_run(&mut doc, now);
            doc.last_error = Some(LastError::new("JobKilledByWorker", now));
            save_doc(tx, &doc)?;
            unlock(tx, id)?;
            record_stat(tx, StatEvent::KillJob, id, now)
        })?;
        tracing::warn!(job_id = %id, "Job killed");
        Ok(())
    }

    /// Sets `wall_at` once. Returns whether it was set by this call.
    pub fn flag_wall(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            if doc.wall_at.is_some() {
                return Ok(false);
            }
            doc.wall_at = Some(now);
            save_doc(tx, &doc)?;
            Ok(true)
        })
    }

    /// Sets `zombie_at` once. Returns whether it was set by this call.
    pub fn flag_zombie(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            if doc.zombie_at.is_some() {
                return Ok(false);
            }
            doc.zombie_at = Some(now);
            save_doc(tx, &doc)?;
            Ok(true)
        })
    }

    /// Journals a live job as it is, then deletes it and its lock.
    pub fn remove_and_journal(&self, id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            let doc = require_doc(tx, id)?;
            retire_doc(tx, &doc, now)
        })?;
        tracing::info!(job_id = %id, "Job removed");
        Ok(())
    }
}
