//! Queue event log.
//!
//! Every client request and job outcome appends one record holding the
//! per-state queue counts as they stand right after the event. The record is
//! written in the same transaction as the event itself.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;

use super::{from_micros, to_micros, ListOptions, QueueStore};
use crate::error::{QueueError, Result};
use crate::job::{JobId, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    EnqueueJob,
    RequestKillJob,
    RequestRemoveJob,
    RestartWaiting,
    RestartStopped,
    CompleteJob,
    DeferJob,
    InactivateJob,
    FailedJob,
    KillJob,
}

impl StatEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatEvent::EnqueueJob => "enqueue_job",
            StatEvent::RequestKillJob => "request_kill_job",
            StatEvent::RequestRemoveJob => "request_remove_job",
            StatEvent::RestartWaiting => "restart_waiting",
            StatEvent::RestartStopped => "restart_stopped",
            StatEvent::CompleteJob => "complete_job",
            StatEvent::DeferJob => "defer_job",
            StatEvent::InactivateJob => "inactivate_job",
            StatEvent::FailedJob => "failed_job",
            StatEvent::KillJob => "kill_job",
        }
    }
}

impl std::fmt::Display for StatEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatRecord {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub job_id: Option<JobId>,
    /// Live jobs per state, in state order
    pub counts: Vec<(JobState, u64)>,
}

impl StatRecord {
    pub fn count(&self, state: JobState) -> u64 {
        self.counts
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }
}

/// Number of live jobs per state, in state order.
pub(crate) fn queue_counts(conn: &Connection) -> Result<Vec<(JobState, u64)>> {
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM queue GROUP BY state")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    Ok(JobState::ALL
        .iter()
        .map(|state| {
            let count = rows.get(state.as_str()).copied().unwrap_or(0);
            (*state, count as u64)
        })
        .collect())
}

pub(crate) fn record_stat(
    conn: &Connection,
    event: StatEvent,
    job_id: JobId,
    now: DateTime<Utc>,
) -> Result<()> {
    let counts: BTreeMap<&str, u64> = queue_counts(conn)?
        .into_iter()
        .map(|(state, count)| (state.as_str(), count))
        .collect();
    conn.execute(
        "INSERT INTO stat (timestamp, event, job_id, counts) VALUES (?1, ?2, ?3, ?4)",
        params![
            to_micros(now),
            event.as_str(),
            job_id.0,
            serde_json::to_string(&counts)?
        ],
    )?;
    Ok(())
}

impl QueueStore {
    /// Event log records, oldest first unless `options.descending`.
    pub fn stats(&self, options: &ListOptions) -> Result<Vec<StatRecord>> {
        let sql = format!(
            "SELECT timestamp, event, job_id, counts FROM stat ORDER BY seq {} LIMIT ?1 OFFSET ?2",
            if options.descending { "DESC" } else { "ASC" }
        );
        let rows = self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![
                        options.limit.map(|l| l as i64).unwrap_or(-1),
                        options.skip as i64
                    ],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(timestamp, event, job_id, raw)| {
                let counts: BTreeMap<String, u64> =
                    serde_json::from_str(&raw).map_err(QueueError::from)?;
                Ok(StatRecord {
                    timestamp: from_micros(timestamp),
                    event,
                    job_id: job_id.map(JobId),
                    counts: JobState::ALL
                        .iter()
                        .map(|state| (*state, counts.get(state.as_str()).copied().unwrap_or(0)))
                        .collect(),
                })
            })
            .collect()
    }
}
