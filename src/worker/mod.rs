//! Worker daemon.
//!
//! A worker repeatedly runs four steps against the shared store:
//! - **work_jobs**: select one eligible job, lock it and launch its process
//! - **remove_jobs**: journal and delete jobs flagged for removal
//! - **flag_jobs**: kill requested or dead jobs, flag non-stop and zombie jobs
//! - **collect_stats**: log queue counts per state
//!
//! Selection keeps an offset cursor so that jobs of equal priority are served
//! round-robin across ticks while a strictly higher priority job still wins.

pub mod launcher;

pub use launcher::{JobLauncher, ProcessLauncher};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExecutionPlan;
use crate::daemon::Daemon;
use crate::error::{QueueError, Result};
use crate::job::{JobDocument, JobId, LastError};
use crate::store::{Candidate, QueueStore, RunningBy, USER_LOCK_HOLDER};

pub const WORKER_KIND: &str = "worker";

pub struct Worker<L: JobLauncher> {
    store: Arc<QueueStore>,
    launcher: L,
    identity: String,
    hostname: String,
    plan: ExecutionPlan,
    alive_timeout: Duration,
    offset: Option<JobId>,
}

impl<L: JobLauncher> Worker<L> {
    pub fn new(
        store: Arc<QueueStore>,
        launcher: L,
        identity: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            store,
            launcher,
            identity: identity.into(),
            hostname: hostname.into(),
            plan: ExecutionPlan::default(),
            alive_timeout: Duration::from_secs(60),
            offset: None,
        }
    }

    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_alive_timeout(mut self, alive_timeout: Duration) -> Self {
        self.alive_timeout = alive_timeout;
        self
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }

    pub fn offset(&self) -> Option<JobId> {
        self.offset
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Picks the next job to dispatch without locking it.
    ///
    /// The best candidate beyond the offset competes with the best candidate
    /// up to the offset; the latter only wins with a strictly greater
    /// `(force, priority)`. With nothing beyond the offset the cursor resets.
    pub fn get_next_job(&mut self, now: DateTime<Utc>) -> Result<Option<Candidate>> {
        let bottom = self
            .store
            .next_candidate(&self.hostname, &self.identity, self.offset, None, now)?;
        let top = match self.offset {
            Some(offset) => self.store.next_candidate(
                &self.hostname,
                &self.identity,
                None,
                Some(offset),
                now,
            )?,
            None => None,
        };
        Ok(match (bottom, top) {
            (Some(bottom), Some(top)) => {
                if (top.force, top.priority) > (bottom.force, bottom.priority) {
                    Some(top)
                } else {
                    Some(bottom)
                }
            }
            (Some(bottom), None) => Some(bottom),
            (None, top) => {
                self.offset = None;
                top
            }
        })
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Dispatches at most one job. Returns the dispatched id.
    pub fn work_jobs(&mut self, now: DateTime<Utc>) -> Result<Option<JobId>> {
        let Some(candidate) = self.get_next_job(now)? else {
            return Ok(None);
        };
        let id = candidate.id;
        if !self.store.lock(id, &self.identity, now)? {
            return Ok(None);
        }
        let doc = match self.store.mark_running(
            id,
            RunningBy {
                worker: &self.identity,
                hostname: &self.hostname,
            },
            now,
        ) {
            Ok(doc) => doc,
            Err(e) if e.is_contention() => {
                tracing::debug!(job_id = %id, error = %e, "Job changed after selection");
                self.store.unlock(id)?;
                return Ok(None);
            }
            Err(e) => {
                self.store.unlock(id)?;
                return Err(e);
            }
        };
        self.offset = Some(id);

        if doc.inactive_at().map(|at| at <= now).unwrap_or(false) {
            tracing::warn!(job_id = %id, "Job exceeded defer_max before start");
            self.store.set_inactive(id, now)?;
            return Ok(Some(id));
        }

        match self.launcher.launch(&doc) {
            Ok(pid) => {
                self.store.set_pid(id, pid)?;
                tracing::info!(job_id = %id, name = doc.name(), pid, trial = doc.trial(), "Dispatched job");
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to launch job process");
                let error = LastError::new(format!("LaunchFailed: {}", e), now);
                self.store.set_failed(id, error, now)?;
            }
        }
        Ok(Some(id))
    }

    /// Journals and deletes every job flagged for removal that can be locked.
    pub fn remove_jobs(&mut self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut removed = Vec::new();
        for doc in self.store.removed_jobs()? {
            let id = doc.id();
            let mut locked = self.store.lock(id, &self.identity, now)?;
            if !locked && self.break_stale_lock(id, now)? {
                locked = self.store.lock(id, &self.identity, now)?;
            }
            if !locked {
                continue;
            }
            match self.store.remove_and_journal(id, now) {
                Ok(()) => removed.push(id),
                Err(e) if e.is_contention() => {
                    tracing::debug!(job_id = %id, error = %e, "Removal lost race");
                    self.store.unlock(id)?;
                }
                Err(e) => {
                    self.store.unlock(id)?;
                    return Err(e);
                }
            }
        }
        Ok(removed)
    }

    /// Deletes the lock on `id` if its holder is a worker that is no longer
    /// alive. Locks held by this worker or by a user are kept.
    fn break_stale_lock(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let Some(holder) = self.store.lock_holder(id)? else {
            return Ok(false);
        };
        if holder == self.identity || holder == USER_LOCK_HOLDER {
            return Ok(false);
        }
        let alive = self
            .store
            .daemon(WORKER_KIND, &holder)?
            .map(|d| d.is_alive(now, self.alive_timeout))
            .unwrap_or(false);
        if alive {
            return Ok(false);
        }
        tracing::warn!(job_id = %id, holder = %holder, "Breaking lock of dead worker");
        self.store.unlock(id)
    }

    /// Supervises running jobs locked by this worker.
    ///
    /// Per job, in order: a kill request terminates the process and kills the
    /// job; a vanished process kills the job; otherwise `wall_at` and
    /// `zombie_at` are each set once when due.
    pub fn flag_jobs(&mut self, now: DateTime<Utc>) -> Result<()> {
        for doc in self.store.running_jobs(&self.identity)? {
            if let Err(e) = self.flag_job(&doc, now) {
                if e.is_contention() {
                    tracing::debug!(job_id = %doc.id(), error = %e, "Job changed while flagging");
                } else {
                    return Err(e);
                }
            }
        }
        self.launcher.reap();
        Ok(())
    }

    fn flag_job(&mut self, doc: &JobDocument, now: DateTime<Utc>) -> Result<()> {
        let id = doc.id();
        if doc.killed_at().is_some() {
            if self.launcher.is_alive(id) {
                self.launcher.terminate(id);
            }
            return self.store.set_killed(id, now);
        }
        if !self.launcher.is_alive(id) {
            tracing::warn!(job_id = %id, "Job process is gone");
            return self.store.set_killed(id, now);
        }
        if let (Some(wall_time), Some(started)) = (doc.wall_time(), doc.started_at()) {
            if now - started >= seconds(wall_time) && self.store.flag_wall(id, now)? {
                tracing::warn!(job_id = %id, wall_time, "Job exceeded wall time");
            }
        }
        if let Some(locked) = doc.locked() {
            if now - locked.heartbeat >= seconds(doc.zombie_time()) && self.store.flag_zombie(id, now)? {
                tracing::warn!(job_id = %id, zombie_time = doc.zombie_time(), "Job turned zombie");
            }
        }
        Ok(())
    }

    pub fn collect_stats(&mut self) -> Result<()> {
        let counts = self.store.count_by_state()?;
        let summary: Vec<String> = counts
            .iter()
            .map(|(state, count)| format!("{}={}", state, count))
            .collect();
        tracing::info!(worker = %self.identity, counts = %summary.join(" "), "Queue stats");
        Ok(())
    }
}

fn seconds(s: u64) -> ChronoDuration {
    ChronoDuration::seconds(s.min(100 * 365 * 24 * 3600) as i64)
}

impl<L: JobLauncher> Daemon for Worker<L> {
    fn kind(&self) -> &'static str {
        WORKER_KIND
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn plan(&self) -> Vec<(&'static str, Duration)> {
        self.plan.steps()
    }

    fn startup(&mut self, _now: DateTime<Utc>) -> Result<()> {
        let released = self.store.release_orphan_locks(&self.identity)?;
        if released > 0 {
            tracing::info!(worker = %self.identity, released, "Released orphan locks");
        }
        Ok(())
    }

    fn run_step(&mut self, step: &str, now: DateTime<Utc>) -> Result<()> {
        match step {
            "work_jobs" => self.work_jobs(now).map(|_| ()),
            "remove_jobs" => self.remove_jobs(now).map(|_| ()),
            "flag_jobs" => self.flag_jobs(now),
            "collect_stats" => self.collect_stats(),
            other => Err(QueueError::Usage(format!("unknown worker step [{}]", other))),
        }
    }

    fn shutdown(&mut self, _now: DateTime<Utc>) -> Result<()> {
        let finished = self.launcher.reap();
        tracing::info!(worker = %self.identity, reaped = finished.len(), "Worker shutting down");
        Ok(())
    }
}
