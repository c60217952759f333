use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::stat::{queue_counts, record_stat, StatEvent};
use super::{
    from_micros, is_constraint, journal_doc, load_doc, require_doc, retire_doc, save_doc,
    to_micros, QueueStore, USER_LOCK_HOLDER,
};
use crate::error::{QueueError, Result};
use crate::job::{JobDocument, JobId, JobState, NewJob, Origin};

/// Filter for [`QueueStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub descending: bool,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Best eligible job within an id window, as seen by one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: JobId,
    pub name: String,
    pub priority: i32,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub id: JobId,
    pub timestamp: DateTime<Utc>,
    pub stdout: String,
    pub stderr: String,
}

fn parse_docs(raw: Vec<String>) -> Result<Vec<JobDocument>> {
    raw.iter()
        .map(|r| serde_json::from_str(r).map_err(QueueError::from))
        .collect()
}

fn query_docs(conn: &Connection, sql: &str, args: Vec<SqlValue>) -> Result<Vec<JobDocument>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params_from_iter(args), |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    parse_docs(raw)
}

fn load_journal(conn: &Connection, id: JobId) -> Result<Option<JobDocument>> {
    let raw: Option<String> = conn
        .query_row("SELECT doc FROM journal WHERE id = ?1", params![id.0], |row| {
            row.get(0)
        })
        .optional()?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(QueueError::from))
        .transpose()
}

fn insert_job(conn: &Connection, job: &NewJob, origin: &Origin) -> Result<JobId> {
    let props = job.properties();
    conn.execute(
        "INSERT INTO queue (name, args_hash, state, priority, forced, attempts_left, max_parallel, nodes, doc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '{}')",
        params![
            job.name(),
            job.args_hash(),
            JobState::Pending.as_str(),
            props.priority,
            props.force,
            props.attempts,
            props.max_parallel,
            serde_json::to_string(&props.nodes)?,
        ],
    )
    .map_err(|e| {
        if is_constraint(&e) {
            QueueError::JobExists {
                name: job.name().to_string(),
                args: serde_json::Value::Object(job.args().clone()).to_string(),
            }
        } else {
            QueueError::from(e)
        }
    })?;
    let id = JobId(conn.last_insert_rowid());
    save_doc(conn, &JobDocument::from_new(id, job, origin))?;
    Ok(id)
}

/// A restarted job keeps the host and user of the original enqueue.
fn restart_origin(doc: &JobDocument, now: DateTime<Utc>) -> Origin {
    Origin {
        at: now,
        hostname: doc.enqueued.hostname.clone(),
        username: doc.enqueued.username.clone(),
    }
}

pub(crate) fn try_lock(conn: &Connection, id: JobId, holder: &str, now: DateTime<Utc>) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO lock (id, holder, at) VALUES (?1, ?2, ?3)",
        params![id.0, holder, to_micros(now)],
    )?;
    Ok(inserted == 1)
}

impl QueueStore {
    // ========================================================================
    // Client operations
    // ========================================================================

    /// Adds a pending job. Fails with `JobExists` while an unfinished job of
    /// the same name and args is live.
    pub fn enqueue(&self, job: &NewJob, origin: &Origin) -> Result<JobId> {
        let id = self.write(|tx| {
            let id = insert_job(tx, job, origin)?;
            record_stat(tx, StatEvent::EnqueueJob, id, origin.at)?;
            Ok(id)
        })?;
        tracing::info!(job_id = %id, name = job.name(), "Enqueued job");
        Ok(id)
    }

    /// Requests a running job to be killed. Returns whether the request was set.
    pub fn kill(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            if doc.state != JobState::Running || doc.killed_at.is_some() {
                return Ok(false);
            }
            doc.killed_at = Some(now);
            save_doc(tx, &doc)?;
            record_stat(tx, StatEvent::RequestKillJob, id, now)?;
            tracing::info!(job_id = %id, "Kill requested");
            Ok(true)
        })
    }

    /// Flags a job for removal. Returns whether the flag was set.
    pub fn remove(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        self.write(|tx| {
            let mut doc = require_doc(tx, id)?;
            if doc.removed_at.is_some() {
                return Ok(false);
            }
            doc.removed_at = Some(now);
            save_doc(tx, &doc)?;
            record_stat(tx, StatEvent::RequestRemoveJob, id, now)?;
            tracing::info!(job_id = %id, "Removal requested");
            Ok(true)
        })
    }

    /// Restarts a waiting or stopped job.
    ///
    /// A waiting job keeps its id and becomes eligible immediately. A stopped
    /// job is replaced by a fresh job linked through `parent_id`/`child_id`,
    /// and the original is journaled.
    pub fn restart(&self, id: JobId, now: DateTime<Utc>) -> Result<JobId> {
        self.write(|tx| match load_doc(tx, id)? {
            Some(mut doc) if doc.state.is_waiting() => {
                doc.query_at = None;
                save_doc(tx, &doc)?;
                record_stat(tx, StatEvent::RestartWaiting, id, now)?;
                tracing::info!(job_id = %id, state = %doc.state, "Restarted waiting job");
                Ok(id)
            }
            Some(mut doc) if doc.state.is_stopped() => {
                if !try_lock(tx, id, USER_LOCK_HOLDER, now)? {
                    return Err(QueueError::conflict(format!("job [{}] is locked", id)));
                }
                let new_id = insert_job(tx, &NewJob::restart_of(&doc), &restart_origin(&doc, now))?;
                doc.enqueued.child_id = Some(new_id);
                retire_doc(tx, &doc, now)?;
                record_stat(tx, StatEvent::RestartStopped, id, now)?;
                tracing::info!(job_id = %id, new_job_id = %new_id, state = %doc.state, "Restarted stopped job");
                Ok(new_id)
            }
            Some(doc) => Err(QueueError::conflict(format!(
                "job [{}] in state [{}] cannot be restarted",
                id, doc.state
            ))),
            None => match load_journal(tx, id)? {
                Some(doc) if doc.state.is_stopped() => {
                    let new_id = insert_job(tx, &NewJob::restart_of(&doc), &restart_origin(&doc, now))?;
                    record_stat(tx, StatEvent::RestartStopped, id, now)?;
                    tracing::info!(job_id = %id, new_job_id = %new_id, "Restarted journaled job");
                    Ok(new_id)
                }
                Some(doc) => Err(QueueError::conflict(format!(
                    "journaled job [{}] in state [{}] cannot be restarted",
                    id, doc.state
                ))),
                None => Err(QueueError::JobNotFound(id.to_string())),
            },
        })
    }

    // ========================================================================
    // Locks and journal
    // ========================================================================

    /// Acquires the lock on `id`. Returns `false` when another holder has it.
    pub fn lock(&self, id: JobId, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let acquired = self.write(|tx| try_lock(tx, id, holder, now))?;
        if !acquired {
            tracing::debug!(job_id = %id, holder, "Lock contention");
        }
        Ok(acquired)
    }

    pub fn unlock(&self, id: JobId) -> Result<bool> {
        self.write(|tx| Ok(tx.execute("DELETE FROM lock WHERE id = ?1", params![id.0])? == 1))
    }

    pub fn lock_holder(&self, id: JobId) -> Result<Option<String>> {
        self.read(|conn| {
            Ok(conn
                .query_row("SELECT holder FROM lock WHERE id = ?1", params![id.0], |row| {
                    row.get(0)
                })
                .optional()?)
        })
    }

    /// Deletes locks held by `holder` whose job no longer exists.
    pub fn release_orphan_locks(&self, holder: &str) -> Result<usize> {
        self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM lock WHERE holder = ?1 AND id NOT IN (SELECT id FROM queue)",
                params![holder],
            )?)
        })
    }

    pub fn journal(&self, doc: &JobDocument, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| journal_doc(tx, doc, now))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn load(&self, id: JobId) -> Result<Option<JobDocument>> {
        self.read(|conn| load_doc(conn, id))
    }

    /// Looks a job up in the live store, then in the journal.
    pub fn find(&self, id: JobId) -> Result<Option<JobDocument>> {
        self.read(|conn| match load_doc(conn, id)? {
            Some(doc) => Ok(Some(doc)),
            None => load_journal(conn, id),
        })
    }

    pub fn journal_entry(&self, id: JobId) -> Result<Option<JobDocument>> {
        self.read(|conn| load_journal(conn, id))
    }

    pub fn list(&self, filter: &JobFilter, options: &ListOptions) -> Result<Vec<JobDocument>> {
        let mut sql = "SELECT doc FROM queue WHERE 1 = 1".to_string();
        let mut args = Vec::new();
        if let Some(state) = filter.state {
            sql.push_str(" AND state = ?");
            args.push(SqlValue::Text(state.as_str().to_string()));
        }
        if let Some(name) = &filter.name {
            sql.push_str(" AND name = ?");
            args.push(SqlValue::Text(name.clone()));
        }
        push_paging(&mut sql, &mut args, options);
        self.read(|conn| query_docs(conn, &sql, args))
    }

    pub fn list_journal(&self, options: &ListOptions) -> Result<Vec<JobDocument>> {
        let mut sql = "SELECT doc FROM journal WHERE 1 = 1".to_string();
        let mut args = Vec::new();
        push_paging(&mut sql, &mut args, options);
        self.read(|conn| query_docs(conn, &sql, args))
    }

    /// Number of live jobs per state, in state order.
    pub fn count_by_state(&self) -> Result<Vec<(JobState, u64)>> {
        self.read(queue_counts)
    }

    /// Live jobs flagged for removal.
    pub fn removed_jobs(&self) -> Result<Vec<JobDocument>> {
        self.read(|conn| {
            query_docs(
                conn,
                "SELECT doc FROM queue WHERE removed_at IS NOT NULL ORDER BY id",
                Vec::new(),
            )
        })
    }

    /// Running jobs locked by `holder`.
    pub fn running_jobs(&self, holder: &str) -> Result<Vec<JobDocument>> {
        self.read(|conn| {
            query_docs(
                conn,
                "SELECT doc FROM queue WHERE state = 'running'
                 AND id IN (SELECT id FROM lock WHERE holder = ?1) ORDER BY id",
                vec![SqlValue::Text(holder.to_string())],
            )
        })
    }

    /// Best eligible job with `after < id <= up_to` for a worker known as
    /// `hostname` and `identity`.
    ///
    /// Eligible: dispatchable state, attempts left, not removed or killed,
    /// `query_at` reached, unlocked, its project not in maintenance,
    /// placement allows this worker, and the type is below `max_parallel` on
    /// this host unless forced.
    pub fn next_candidate(
        &self,
        hostname: &str,
        identity: &str,
        after: Option<JobId>,
        up_to: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Candidate>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT q.id, q.name, q.priority, q.forced FROM queue q
                     WHERE q.state IN ('pending', 'failed', 'deferred')
                       AND q.attempts_left > 0
                       AND q.removed_at IS NULL
                       AND q.killed_at IS NULL
                       AND (q.query_at IS NULL OR q.query_at <= ?1)
                       AND NOT EXISTS (SELECT 1 FROM lock l WHERE l.id = q.id)
                       AND (CASE WHEN instr(q.name, '.') > 0
                                 THEN substr(q.name, 1, instr(q.name, '.') - 1)
                                 ELSE q.name END)
                           NOT IN (SELECT project FROM project_maintenance)
                       AND (json_array_length(q.nodes) = 0
                            OR EXISTS (SELECT 1 FROM json_each(q.nodes) n WHERE n.value IN (?2, ?3)))
                       AND (q.forced = 1 OR q.max_parallel IS NULL
                            OR (SELECT COUNT(*) FROM queue r
                                WHERE r.state = 'running' AND r.name = q.name AND r.host = ?2)
                               < q.max_parallel)
                       AND q.id > ?4 AND q.id <= ?5
                     ORDER BY q.forced DESC, q.priority DESC, q.id ASC
                     LIMIT 1",
                    params![
                        to_micros(now),
                        hostname,
                        identity,
                        after.map(|id| id.0).unwrap_or(i64::MIN),
                        up_to.map(|id| id.0).unwrap_or(i64::MAX),
                    ],
                    |row| {
                        Ok(Candidate {
                            id: JobId(row.get(0)?),
                            name: row.get(1)?,
                            priority: row.get(2)?,
                            force: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    // ========================================================================
    // Captured process output
    // ========================================================================

    pub fn save_output(&self, id: JobId, stdout: &str, stderr: &str, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO output (id, timestamp, stdout, stderr) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET timestamp = excluded.timestamp,
                    stdout = output.stdout || excluded.stdout,
                    stderr = output.stderr || excluded.stderr",
                params![id.0, to_micros(now), stdout, stderr],
            )?;
            Ok(())
        })
    }

    pub fn output(&self, id: JobId) -> Result<Option<OutputRecord>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, timestamp, stdout, stderr FROM output WHERE id = ?1",
                    params![id.0],
                    |row| {
                        Ok(OutputRecord {
                            id: JobId(row.get(0)?),
                            timestamp: from_micros(row.get(1)?),
                            stdout: row.get(2)?,
                            stderr: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}

fn push_paging(sql: &mut String, args: &mut Vec<SqlValue>, options: &ListOptions) {
    sql.push_str(if options.descending {
        " ORDER BY id DESC"
    } else {
        " ORDER BY id ASC"
    });
    sql.push_str(" LIMIT ? OFFSET ?");
    args.push(SqlValue::Integer(
        options.limit.map(|l| l as i64).unwrap_or(-1),
    ));
    args.push(SqlValue::Integer(options.skip as i64));
}
