use rusqlite::Connection;

use crate::error::{QueueError, Result};

pub struct Table {
    pub name: &'static str,
    pub schema: &'static str,
    pub indices: &'static [&'static str],
}

/// Live job documents. `doc` holds the full JSON document; the other columns
/// mirror the fields that queries filter and sort on.
const QUEUE_TABLE_V_0: Table = Table {
    name: "queue",
    schema: "CREATE TABLE IF NOT EXISTS queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        args_hash TEXT NOT NULL,
        state TEXT NOT NULL,
        priority INTEGER NOT NULL,
        forced INTEGER NOT NULL,
        attempts_left INTEGER NOT NULL,
        max_parallel INTEGER,
        nodes TEXT NOT NULL,
        host TEXT,
        query_at INTEGER,
        removed_at INTEGER,
        killed_at INTEGER,
        doc TEXT NOT NULL
    );",
    indices: &[
        "CREATE UNIQUE INDEX IF NOT EXISTS queue_unfinished_index ON queue (name, args_hash) WHERE state NOT IN ('complete', 'error', 'inactive', 'killed');",
        "CREATE INDEX IF NOT EXISTS queue_state_index ON queue (state, forced, priority, id);",
    ],
};

const LOCK_TABLE_V_0: Table = Table {
    name: "lock",
    schema: "CREATE TABLE IF NOT EXISTS lock (
        id INTEGER PRIMARY KEY,
        holder TEXT NOT NULL,
        at INTEGER NOT NULL
    );",
    indices: &["CREATE INDEX IF NOT EXISTS lock_holder_index ON lock (holder);"],
};

const JOURNAL_TABLE_V_0: Table = Table {
    name: "journal",
    schema: "CREATE TABLE IF NOT EXISTS journal (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        state TEXT NOT NULL,
        journaled_at INTEGER NOT NULL,
        doc TEXT NOT NULL
    );",
    indices: &["CREATE INDEX IF NOT EXISTS journal_name_index ON journal (name);"],
};

const DAEMON_TABLE_V_0: Table = Table {
    name: "daemon",
    schema: "CREATE TABLE IF NOT EXISTS daemon (
        kind TEXT NOT NULL,
        identity TEXT NOT NULL,
        hostname TEXT NOT NULL,
        pid INTEGER NOT NULL,
        heartbeat INTEGER NOT NULL,
        startup_at INTEGER,
        loop_at INTEGER,
        shutdown_at INTEGER,
        exit_at INTEGER,
        PRIMARY KEY (kind, identity)
    );",
    indices: &[],
};

const CONTROL_TABLE_V_0: Table = Table {
    name: "control",
    schema: "CREATE TABLE IF NOT EXISTS control (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );",
    indices: &[],
};

const OUTPUT_TABLE_V_0: Table = Table {
    name: "output",
    schema: "CREATE TABLE IF NOT EXISTS output (
        id INTEGER PRIMARY KEY,
        timestamp INTEGER NOT NULL,
        stdout TEXT NOT NULL,
        stderr TEXT NOT NULL
    );",
    indices: &[],
};

/// Projects whose jobs are not dispatched.
const PROJECT_MAINTENANCE_TABLE_V_1: Table = Table {
    name: "project_maintenance",
    schema: "CREATE TABLE IF NOT EXISTS project_maintenance (
        project TEXT PRIMARY KEY,
        at INTEGER NOT NULL
    );",
    indices: &[],
};

/// Queue event log: per-state counts taken right after each event.
const STAT_TABLE_V_1: Table = Table {
    name: "stat",
    schema: "CREATE TABLE IF NOT EXISTS stat (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        event TEXT NOT NULL,
        job_id INTEGER,
        counts TEXT NOT NULL
    );",
    indices: &["CREATE INDEX IF NOT EXISTS stat_event_index ON stat (event, timestamp);"],
};

pub struct VersionedSchema {
    pub version: u32,
    pub tables: &'static [Table],
}

impl VersionedSchema {
    fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            conn.execute_batch(table.schema)?;
            for index in table.indices {
                conn.execute_batch(index)?;
            }
        }
        conn.pragma_update(None, "user_version", self.version)?;
        Ok(())
    }
}

pub const VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            QUEUE_TABLE_V_0,
            LOCK_TABLE_V_0,
            JOURNAL_TABLE_V_0,
            DAEMON_TABLE_V_0,
            CONTROL_TABLE_V_0,
            OUTPUT_TABLE_V_0,
        ],
    },
    VersionedSchema {
        version: 2,
        tables: &[
            QUEUE_TABLE_V_0,
            LOCK_TABLE_V_0,
            JOURNAL_TABLE_V_0,
            DAEMON_TABLE_V_0,
            CONTROL_TABLE_V_0,
            OUTPUT_TABLE_V_0,
            PROJECT_MAINTENANCE_TABLE_V_1,
            STAT_TABLE_V_1,
        ],
    },
];

/// Creates the current schema if the database is empty or older, and rejects
/// databases written by a newer version. Tables only ever get added, so an
/// older database is upgraded by creating the missing ones.
///
/// Must run inside a write transaction so concurrent openers serialize.
pub(crate) fn install(conn: &Connection) -> Result<()> {
    let current = VERSIONED_SCHEMAS
        .last()
        .ok_or_else(|| QueueError::Config("no schema defined".to_string()))?;
    let version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if version > current.version {
        return Err(QueueError::Config(format!(
            "database version {} is newer than supported version {}",
            version, current.version
        )));
    }
    if version < current.version {
        tracing::info!(from = version, to = current.version, "Installing queue schema");
        current.create(conn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        install(&conn).unwrap();
        install(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('queue', 'lock', 'journal', 'daemon', 'control', 'output', 'project_maintenance', 'stat')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 8);
    }

    #[test]
    fn version_one_database_is_upgraded() {
        let conn = Connection::open_in_memory().unwrap();
        VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        conn.execute(
            "INSERT INTO control (key, value) VALUES ('maintenance', 1)",
            [],
        )
        .unwrap();

        install(&conn).unwrap();

        let version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0)).unwrap();
        assert_eq!(version, 2);
        let kept: i64 = conn
            .query_row("SELECT COUNT(*) FROM control", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, 1);
        conn.execute("INSERT INTO project_maintenance (project, at) VALUES ('demo', 0)", [])
            .unwrap();
    }

    #[test]
    fn newer_database_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(install(&conn), Err(QueueError::Config(_))));
    }
}
