use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use std::collections::HashMap;
use std::fmt;

use super::{parse_optional_rfc3339, parse_rfc3339, Store};

/// Lifecycle of a run: created as `running`, updated exactly once to a
/// terminal `completed`/`failed`, never mutated thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invocation of the Claude CLI for a task.
#[derive(Debug, Clone, Default)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub output: String,
    pub error: String,
    pub session_id: String,
}

const RUN_COLUMNS: &str =
    "id, task_id, started_at, ended_at, status, output, error, session_id";

struct RawRun {
    id: i64,
    task_id: i64,
    started_at: String,
    ended_at: Option<String>,
    status: String,
    output: String,
    error: String,
    session_id: String,
}

fn read_raw_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        task_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        status: row.get(4)?,
        output: row.get(5)?,
        error: row.get(6)?,
        session_id: row.get(7)?,
    })
}

impl TryFrom<RawRun> for TaskRun {
    type Error = anyhow::Error;

    fn try_from(raw: RawRun) -> Result<Self> {
        Ok(TaskRun {
            id: raw.id,
            task_id: raw.task_id,
            started_at: parse_rfc3339(&raw.started_at)?,
            ended_at: parse_optional_rfc3339(raw.ended_at)?,
            status: RunStatus::from_db(&raw.status),
            output: raw.output,
            error: raw.error,
            session_id: raw.session_id,
        })
    }
}

impl Store {
    pub fn create_task_run(&self, run: &mut TaskRun) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_runs (task_id, started_at, ended_at, status, output, error, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.task_id,
                    run.started_at.to_rfc3339(),
                    run.ended_at.as_ref().map(DateTime::to_rfc3339),
                    run.status.as_str(),
                    run.output,
                    run.error,
                    run.session_id,
                ],
            )
            .context("failed to insert task run")?;
            run.id = conn.last_insert_rowid();
            Ok(())
        })
    }

    pub fn update_task_run(&self, run: &TaskRun) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_runs SET ended_at = ?1, status = ?2, output = ?3, error = ?4
                 WHERE id = ?5",
                params![
                    run.ended_at.as_ref().map(DateTime::to_rfc3339),
                    run.status.as_str(),
                    run.output,
                    run.error,
                    run.id,
                ],
            )
            .with_context(|| format!("failed to update task run {}", run.id))
        })?;
        anyhow::ensure!(changed > 0, "task run {} not found", run.id);
        Ok(())
    }

    /// Most recent runs first.
    pub fn get_task_runs(&self, task_id: i64, limit: usize) -> Result<Vec<TaskRun>> {
        let raw_runs = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {RUN_COLUMNS} FROM task_runs
                     WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))
                .context("failed to prepare run listing")?;
            let rows = stmt
                .query_map(params![task_id, limit as i64], read_raw_run)
                .context("failed to list task runs")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to read task run rows")?;
            Ok(rows)
        })?;

        raw_runs.into_iter().map(TaskRun::try_from).collect()
    }

    pub fn get_task_run(&self, task_id: i64, run_id: i64) -> Result<TaskRun> {
        let raw = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE task_id = ?1 AND id = ?2"),
                params![task_id, run_id],
                read_raw_run,
            )
            .with_context(|| format!("failed to load run {run_id} for task {task_id}"))
        })?;
        raw.try_into()
    }

    pub fn get_latest_task_run(&self, task_id: i64) -> Result<TaskRun> {
        let raw = self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM task_runs
                     WHERE task_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![task_id],
                read_raw_run,
            )
            .with_context(|| format!("failed to load latest run for task {task_id}"))
        })?;
        raw.try_into()
    }

    /// Status of every task's most recent run in one query, so batch
    /// refreshes never fan out per task.
    pub fn get_last_run_statuses(&self) -> Result<HashMap<i64, RunStatus>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT tr.task_id, tr.status
                     FROM task_runs tr
                     JOIN (
                         SELECT task_id, MAX(id) AS max_id
                         FROM task_runs GROUP BY task_id
                     ) latest ON tr.task_id = latest.task_id AND tr.id = latest.max_id",
                )
                .context("failed to prepare last-run status query")?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .context("failed to query last-run statuses")?;

            let mut statuses = HashMap::new();
            for row in rows {
                let (task_id, status) = row.context("failed to read last-run status row")?;
                statuses.insert(task_id, RunStatus::from_db(&status));
            }
            Ok(statuses)
        })
    }
}
