//! SQLite-backed queue store.
//!
//! The store is the only shared mutable state. Every daemon and job process
//! opens its own [`QueueStore`] on the same database file. Conditional
//! updates run in `IMMEDIATE` transactions so that concurrent writers across
//! processes serialize on the database lock.

mod daemon;
mod outcome;
mod queue;
pub mod schema;
mod stat;

pub use daemon::{DaemonPhase, DaemonRecord};
pub use outcome::RunningBy;
pub use queue::{Candidate, JobFilter, ListOptions, OutputRecord};
pub use stat::{StatEvent, StatRecord};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{QueueError, Result};
use crate::job::{JobDocument, JobId};

/// Lock holder used for operations requested by a user rather than a worker.
pub const USER_LOCK_HOLDER: &str = "__user__";

#[derive(Debug)]
pub struct QueueStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl QueueStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(config.path.clone()),
        };
        store.write(|tx| schema::install(tx))?;
        tracing::debug!(path = %config.path.display(), "Opened queue store");
        Ok(store)
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&StoreConfig {
            path: path.as_ref().to_path_buf(),
            ..StoreConfig::default()
        })
    }

    /// Private in-memory store, visible to this handle only.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        store.write(|tx| schema::install(tx))?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` in an IMMEDIATE transaction. Any error rolls back.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn();
        f(&conn)
    }
}

pub(crate) fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

pub(crate) fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

pub(crate) fn load_doc(conn: &Connection, id: JobId) -> Result<Option<JobDocument>> {
    let raw: Option<String> = conn
        .query_row("SELECT doc FROM queue WHERE id = ?1", params![id.0], |row| {
            row.get(0)
        })
        .optional()?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(QueueError::from))
        .transpose()
}

pub(crate) fn require_doc(conn: &Connection, id: JobId) -> Result<JobDocument> {
    load_doc(conn, id)?.ok_or_else(|| QueueError::JobNotFound(id.to_string()))
}

/// Writes the document and its mirrored columns.
pub(crate) fn save_doc(conn: &Connection, doc: &JobDocument) -> Result<()> {
    let raw = serde_json::to_string(doc)?;
    let nodes = serde_json::to_string(&doc.nodes)?;
    let updated = conn.execute(
        "UPDATE queue SET state = ?2, priority = ?3, forced = ?4, attempts_left = ?5,
            max_parallel = ?6, nodes = ?7, host = ?8, query_at = ?9, removed_at = ?10,
            killed_at = ?11, doc = ?12
         WHERE id = ?1",
        params![
            doc.id.0,
            doc.state.as_str(),
            doc.priority,
            doc.force,
            doc.attempts_left,
            doc.max_parallel,
            nodes,
            doc.locked.as_ref().map(|l| l.hostname.as_str()),
            doc.query_at.map(to_micros),
            doc.removed_at.map(to_micros),
            doc.killed_at.map(to_micros),
            raw,
        ],
    )?;
    if updated == 0 {
        return Err(QueueError::JobNotFound(doc.id.to_string()));
    }
    Ok(())
}

/// Inserts an immutable journal copy of `doc`. A duplicate id is a conflict.
pub(crate) fn journal_doc(conn: &Connection, doc: &JobDocument, now: DateTime<Utc>) -> Result<()> {
    let raw = serde_json::to_string(doc)?;
    conn.execute(
        "INSERT INTO journal (id, name, state, journaled_at, doc) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![doc.id.0, doc.name, doc.state.as_str(), to_micros(now), raw],
    )
    .map_err(|e| {
        if is_constraint(&e) {
            QueueError::conflict(format!("job [{}] already journaled", doc.id))
        } else {
            QueueError::from(e)
        }
    })?;
    Ok(())
}

/// Journals `doc`, then deletes the live document and its lock. The journal
/// insert runs first so a failed insert aborts the deletion.
pub(crate) fn retire_doc(conn: &Connection, doc: &JobDocument, now: DateTime<Utc>) -> Result<()> {
    journal_doc(conn, doc, now)?;
    conn.execute("DELETE FROM queue WHERE id = ?1", params![doc.id.0])?;
    conn.execute("DELETE FROM lock WHERE id = ?1", params![doc.id.0])?;
    Ok(())
}
