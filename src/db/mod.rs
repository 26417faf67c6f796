//! Embedded SQLite store shared by every process that points at the same
//! data directory. All cross-process coordination (most importantly the
//! scheduler lease) rides on this file's transactional semantics.

mod lease;
mod run;
mod task;

pub use lease::SchedulerLease;
pub use run::{RunStatus, TaskRun};
pub use task::{Task, DEFAULT_PERMISSION_MODE};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

pub const DEFAULT_USAGE_THRESHOLD: f64 = 80.0;

/// Single-writer handle over the tasks database. Operations are synchronous
/// and short; callers in async contexts invoke them inline.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies
    /// migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to configure busy timeout")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;

        migrate(&conn).context("failed to migrate database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut conn)
    }

    /// Reads the usage threshold setting, seeded to 80 on first migration.
    pub fn get_usage_threshold(&self) -> Result<f64> {
        self.with_conn(|conn| {
            let raw: String = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = 'usage_threshold'",
                    [],
                    |row| row.get(0),
                )
                .context("failed to read usage threshold")?;
            raw.parse::<f64>()
                .with_context(|| format!("invalid usage threshold value: {raw}"))
        })
    }

    pub fn set_usage_threshold(&self, threshold: f64) -> Result<()> {
        anyhow::ensure!(
            (0.0..=100.0).contains(&threshold),
            "usage threshold must be between 0 and 100"
        );
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES ('usage_threshold', ?1)",
                [threshold.to_string()],
            )
            .context("failed to write usage threshold")?;
            Ok(())
        })
    }
}

/// True when the error chain bottoms out in a missing-row lookup.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::QueryReturnedNoRows)
    )
}

pub(crate) fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid RFC 3339 timestamp in database: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub(crate) fn parse_optional_rfc3339(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_rfc3339(&value)).transpose()
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL,
            prompt          TEXT NOT NULL,
            cron_expr       TEXT NOT NULL DEFAULT '',
            working_dir     TEXT NOT NULL DEFAULT '.',
            discord_webhook TEXT NOT NULL DEFAULT '',
            enabled         INTEGER NOT NULL DEFAULT 1,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            last_run_at     TEXT,
            next_run_at     TEXT
        );
        CREATE TABLE IF NOT EXISTS task_runs (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id    INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            ended_at   TEXT,
            status     TEXT NOT NULL DEFAULT 'pending',
            output     TEXT NOT NULL DEFAULT '',
            error      TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_task_runs_task_id ON task_runs(task_id);
        CREATE INDEX IF NOT EXISTS idx_task_runs_started_at ON task_runs(started_at);
        CREATE TABLE IF NOT EXISTS scheduler_leases (
            id               INTEGER PRIMARY KEY CHECK (id = 1),
            holder_id        TEXT NOT NULL,
            lease_expires_at INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS settings (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        INSERT OR IGNORE INTO settings (key, value) VALUES ('usage_threshold', '80');",
    )
    .context("failed to create base schema")?;

    // Columns introduced after the original schema shipped.
    add_column_if_missing(conn, "ALTER TABLE tasks ADD COLUMN scheduled_at TEXT")?;
    add_column_if_missing(
        conn,
        "ALTER TABLE tasks ADD COLUMN slack_webhook TEXT NOT NULL DEFAULT ''",
    )?;
    add_column_if_missing(conn, "ALTER TABLE tasks ADD COLUMN model TEXT NOT NULL DEFAULT ''")?;
    add_column_if_missing(
        conn,
        "ALTER TABLE tasks ADD COLUMN permission_mode TEXT NOT NULL DEFAULT 'default'",
    )?;
    add_column_if_missing(
        conn,
        "ALTER TABLE task_runs ADD COLUMN session_id TEXT NOT NULL DEFAULT ''",
    )?;

    Ok(())
}

fn add_column_if_missing(conn: &Connection, sql: &str) -> Result<()> {
    match conn.execute(sql, []) {
        Ok(_) => Ok(()),
        Err(error) => {
            if error.to_string().contains("duplicate column name") {
                Ok(())
            } else {
                Err(error).with_context(|| format!("failed to apply migration: {sql}"))
            }
        }
    }
}
