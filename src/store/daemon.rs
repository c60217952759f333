//! Daemon registration records and global control flags.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::time::Duration;

use super::{from_micros, to_micros, QueueStore};
use crate::error::{QueueError, Result};

const HALT_KEY: &str = "halt";
const MAINTENANCE_KEY: &str = "maintenance";
const WATERMARK_KEY: &str = "schedule_watermark";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonPhase {
    Startup,
    Loop,
    Shutdown,
    Exit,
}

impl DaemonPhase {
    fn column(&self) -> &'static str {
        match self {
            DaemonPhase::Startup => "startup_at",
            DaemonPhase::Loop => "loop_at",
            DaemonPhase::Shutdown => "shutdown_at",
            DaemonPhase::Exit => "exit_at",
        }
    }
}

impl std::fmt::Display for DaemonPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DaemonPhase::Startup => "startup",
            DaemonPhase::Loop => "loop",
            DaemonPhase::Shutdown => "shutdown",
            DaemonPhase::Exit => "exit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonRecord {
    pub kind: String,
    pub identity: String,
    pub hostname: String,
    pub pid: u32,
    pub heartbeat: DateTime<Utc>,
    pub startup_at: Option<DateTime<Utc>>,
    pub loop_at: Option<DateTime<Utc>>,
    pub shutdown_at: Option<DateTime<Utc>>,
    pub exit_at: Option<DateTime<Utc>>,
}

impl DaemonRecord {
    /// A record is live while it has not exited and its heartbeat is younger
    /// than `alive_timeout`.
    pub fn is_alive(&self, now: DateTime<Utc>, alive_timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(alive_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        self.exit_at.is_none() && now - self.heartbeat < timeout
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            kind: row.get(0)?,
            identity: row.get(1)?,
            hostname: row.get(2)?,
            pid: row.get(3)?,
            heartbeat: from_micros(row.get(4)?),
            startup_at: row.get::<_, Option<i64>>(5)?.map(from_micros),
            loop_at: row.get::<_, Option<i64>>(6)?.map(from_micros),
            shutdown_at: row.get::<_, Option<i64>>(7)?.map(from_micros),
            exit_at: row.get::<_, Option<i64>>(8)?.map(from_micros),
        })
    }
}

const DAEMON_COLUMNS: &str =
    "kind, identity, hostname, pid, heartbeat, startup_at, loop_at, shutdown_at, exit_at";

fn load_daemon(conn: &Connection, kind: &str, identity: &str) -> Result<Option<DaemonRecord>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM daemon WHERE kind = ?1 AND identity = ?2",
                DAEMON_COLUMNS
            ),
            params![kind, identity],
            DaemonRecord::from_row,
        )
        .optional()?)
}

fn get_control(conn: &Connection, key: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT value FROM control WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn set_control(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO control (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// A project is the first segment of qualified job names.
fn check_project(project: &str) -> Result<()> {
    if project.trim().is_empty() || project.contains('.') {
        return Err(QueueError::validation(format!(
            "invalid project [{}], expected a name without dots",
            project
        )));
    }
    Ok(())
}

impl QueueStore {
    /// Registers a daemon and timestamps its startup phase.
    ///
    /// Fails with `Conflict` while a live record with the same kind and
    /// identity exists.
    pub fn register_daemon(
        &self,
        kind: &str,
        identity: &str,
        hostname: &str,
        pid: u32,
        now: DateTime<Utc>,
        alive_timeout: Duration,
    ) -> Result<()> {
        self.write(|tx| {
            if let Some(existing) = load_daemon(tx, kind, identity)? {
                if existing.is_alive(now, alive_timeout) {
                    return Err(QueueError::conflict(format!(
                        "{} [{}] is already running on [{}] with pid {}",
                        kind, identity, existing.hostname, existing.pid
                    )));
                }
            }
            tx.execute(
                "INSERT OR REPLACE INTO daemon (kind, identity, hostname, pid, heartbeat, startup_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![kind, identity, hostname, pid, to_micros(now)],
            )?;
            Ok(())
        })
    }

    pub fn enter_phase(&self, kind: &str, identity: &str, phase: DaemonPhase, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            let updated = tx.execute(
                &format!(
                    "UPDATE daemon SET {} = ?3, heartbeat = ?3 WHERE kind = ?1 AND identity = ?2",
                    phase.column()
                ),
                params![kind, identity, to_micros(now)],
            )?;
            if updated == 0 {
                return Err(QueueError::conflict(format!(
                    "{} [{}] is not registered",
                    kind, identity
                )));
            }
            Ok(())
        })
    }

    pub fn daemon_heartbeat(&self, kind: &str, identity: &str, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE daemon SET heartbeat = ?3 WHERE kind = ?1 AND identity = ?2",
                params![kind, identity, to_micros(now)],
            )?;
            Ok(())
        })
    }

    pub fn daemon(&self, kind: &str, identity: &str) -> Result<Option<DaemonRecord>> {
        self.read(|conn| load_daemon(conn, kind, identity))
    }

    pub fn live_daemons(&self, now: DateTime<Utc>, alive_timeout: Duration) -> Result<Vec<DaemonRecord>> {
        let all = self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM daemon ORDER BY kind, identity",
                DAEMON_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], DaemonRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(all
            .into_iter()
            .filter(|d| d.is_alive(now, alive_timeout))
            .collect())
    }

    // ========================================================================
    // Control flags
    // ========================================================================

    /// Asks every daemon started before `now` to leave its loop.
    pub fn request_halt(&self, now: DateTime<Utc>) -> Result<()> {
        self.write(|tx| set_control(tx, HALT_KEY, to_micros(now)))?;
        tracing::info!(at = %now, "Halt requested");
        Ok(())
    }

    /// Whether a halt was requested at or after `since`.
    pub fn halt_requested_since(&self, since: DateTime<Utc>) -> Result<bool> {
        let halt = self.read(|conn| get_control(conn, HALT_KEY))?;
        Ok(halt.map(|at| at >= to_micros(since)).unwrap_or(false))
    }

    pub fn enter_maintenance(&self) -> Result<()> {
        self.write(|tx| set_control(tx, MAINTENANCE_KEY, 1))?;
        tracing::info!("Entered maintenance");
        Ok(())
    }

    pub fn leave_maintenance(&self) -> Result<()> {
        self.write(|tx| {
            tx.execute("DELETE FROM control WHERE key = ?1", params![MAINTENANCE_KEY])?;
            Ok(())
        })?;
        tracing::info!("Left maintenance");
        Ok(())
    }

    pub fn in_maintenance(&self) -> Result<bool> {
        Ok(self.read(|conn| get_control(conn, MAINTENANCE_KEY))?.is_some())
    }

    /// Stops dispatch of every job type in `project`. Returns whether the
    /// project was not in maintenance before.
    pub fn enter_project_maintenance(&self, project: &str, now: DateTime<Utc>) -> Result<bool> {
        check_project(project)?;
        let entered = self.write(|tx| {
            Ok(tx.execute(
                "INSERT OR IGNORE INTO project_maintenance (project, at) VALUES (?1, ?2)",
                params![project, to_micros(now)],
            )? == 1)
        })?;
        tracing::info!(project, "Entered project maintenance");
        Ok(entered)
    }

    /// Returns whether the project was in maintenance.
    pub fn leave_project_maintenance(&self, project: &str) -> Result<bool> {
        check_project(project)?;
        let left = self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM project_maintenance WHERE project = ?1",
                params![project],
            )? == 1)
        })?;
        tracing::info!(project, "Left project maintenance");
        Ok(left)
    }

    pub fn project_in_maintenance(&self, project: &str) -> Result<bool> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM project_maintenance WHERE project = ?1",
                    params![project],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
    }

    pub fn projects_in_maintenance(&self) -> Result<Vec<String>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT project FROM project_maintenance ORDER BY project")?;
            let projects = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(projects)
        })
    }

    pub fn schedule_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read(|conn| get_control(conn, WATERMARK_KEY))?
            .map(from_micros))
    }

    pub fn set_schedule_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        self.write(|tx| set_control(tx, WATERMARK_KEY, to_micros(at)))
    }
}
