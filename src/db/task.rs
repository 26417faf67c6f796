use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{parse_optional_rfc3339, parse_rfc3339, Store};

pub const DEFAULT_PERMISSION_MODE: &str = "default";

/// A scheduled Claude CLI invocation. One-off tasks carry an empty
/// `cron_expr` and fire at most once at `scheduled_at`.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub prompt: String,
    pub cron_expr: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub working_dir: String,
    pub discord_webhook: String,
    pub slack_webhook: String,
    pub model: String,
    pub permission_mode: String,
    pub enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_one_off(&self) -> bool {
        self.cron_expr.is_empty()
    }
}

const TASK_COLUMNS: &str = "id, name, prompt, cron_expr, scheduled_at, working_dir, \
     discord_webhook, slack_webhook, model, permission_mode, enabled, \
     created_at, updated_at, last_run_at, next_run_at";

struct RawTask {
    id: i64,
    name: String,
    prompt: String,
    cron_expr: String,
    scheduled_at: Option<String>,
    working_dir: String,
    discord_webhook: String,
    slack_webhook: String,
    model: String,
    permission_mode: String,
    enabled: bool,
    created_at: String,
    updated_at: String,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
}

fn read_raw_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        name: row.get(1)?,
        prompt: row.get(2)?,
        cron_expr: row.get(3)?,
        scheduled_at: row.get(4)?,
        working_dir: row.get(5)?,
        discord_webhook: row.get(6)?,
        slack_webhook: row.get(7)?,
        model: row.get(8)?,
        permission_mode: row.get(9)?,
        enabled: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        last_run_at: row.get(13)?,
        next_run_at: row.get(14)?,
    })
}

impl TryFrom<RawTask> for Task {
    type Error = anyhow::Error;

    fn try_from(raw: RawTask) -> Result<Self> {
        Ok(Task {
            id: raw.id,
            name: raw.name,
            prompt: raw.prompt,
            cron_expr: raw.cron_expr,
            scheduled_at: parse_optional_rfc3339(raw.scheduled_at)?,
            working_dir: raw.working_dir,
            discord_webhook: raw.discord_webhook,
            slack_webhook: raw.slack_webhook,
            model: raw.model,
            permission_mode: raw.permission_mode,
            enabled: raw.enabled,
            created_at: Some(parse_rfc3339(&raw.created_at)?),
            updated_at: Some(parse_rfc3339(&raw.updated_at)?),
            last_run_at: parse_optional_rfc3339(raw.last_run_at)?,
            next_run_at: parse_optional_rfc3339(raw.next_run_at)?,
        })
    }
}

impl Store {
    /// Inserts a new task and fills in its id and timestamps.
    pub fn create_task(&self, task: &mut Task) -> Result<()> {
        let now = Utc::now();
        if task.working_dir.is_empty() {
            task.working_dir = ".".to_string();
        }
        if task.permission_mode.is_empty() {
            task.permission_mode = DEFAULT_PERMISSION_MODE.to_string();
        }

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (
                    name, prompt, cron_expr, scheduled_at, working_dir,
                    discord_webhook, slack_webhook, model, permission_mode,
                    enabled, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.name,
                    task.prompt,
                    task.cron_expr,
                    task.scheduled_at.as_ref().map(DateTime::to_rfc3339),
                    task.working_dir,
                    task.discord_webhook,
                    task.slack_webhook,
                    task.model,
                    task.permission_mode,
                    task.enabled,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .context("failed to insert task")?;
            task.id = conn.last_insert_rowid();
            Ok(())
        })?;

        task.created_at = Some(now);
        task.updated_at = Some(now);
        Ok(())
    }

    pub fn get_task(&self, id: i64) -> Result<Task> {
        let raw = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                read_raw_task,
            )
            .with_context(|| format!("failed to load task {id}"))
        })?;
        raw.try_into()
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let raw_tasks = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id ASC"))
                .context("failed to prepare task listing")?;
            let rows = stmt
                .query_map([], read_raw_task)
                .context("failed to list tasks")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to read task rows")?;
            Ok(rows)
        })?;

        raw_tasks.into_iter().map(Task::try_from).collect()
    }

    /// Writes every mutable column of `task`; errors when the row is gone.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        let now = Utc::now();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET
                    name = ?1, prompt = ?2, cron_expr = ?3, scheduled_at = ?4,
                    working_dir = ?5, discord_webhook = ?6, slack_webhook = ?7,
                    model = ?8, permission_mode = ?9, enabled = ?10,
                    updated_at = ?11, last_run_at = ?12, next_run_at = ?13
                 WHERE id = ?14",
                params![
                    task.name,
                    task.prompt,
                    task.cron_expr,
                    task.scheduled_at.as_ref().map(DateTime::to_rfc3339),
                    task.working_dir,
                    task.discord_webhook,
                    task.slack_webhook,
                    task.model,
                    task.permission_mode,
                    task.enabled,
                    now.to_rfc3339(),
                    task.last_run_at.as_ref().map(DateTime::to_rfc3339),
                    task.next_run_at.as_ref().map(DateTime::to_rfc3339),
                    task.id,
                ],
            )
            .with_context(|| format!("failed to update task {}", task.id))
        })?;

        anyhow::ensure!(changed > 0, "task {} not found", task.id);
        Ok(())
    }

    /// Narrow update for the scheduler's projected next firing; leaves the
    /// user-editable columns and `updated_at` untouched.
    pub fn update_task_next_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET next_run_at = ?1 WHERE id = ?2",
                params![next_run_at.as_ref().map(DateTime::to_rfc3339), id],
            )
            .with_context(|| format!("failed to update next run for task {id}"))
        })?;
        anyhow::ensure!(changed > 0, "task {id} not found");
        Ok(())
    }

    /// Narrow update written by the executor when a run reaches a terminal
    /// state.
    pub fn update_task_last_run(&self, id: i64, last_run_at: DateTime<Utc>) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET last_run_at = ?1 WHERE id = ?2",
                params![last_run_at.to_rfc3339(), id],
            )
            .with_context(|| format!("failed to update last run for task {id}"))
        })?;
        anyhow::ensure!(changed > 0, "task {id} not found");
        Ok(())
    }

    /// A fired one-off never fires again: disabled, with no projected next
    /// run.
    pub fn disable_one_off(&self, id: i64) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET enabled = 0, next_run_at = NULL WHERE id = ?1",
                params![id],
            )
            .with_context(|| format!("failed to disable one-off task {id}"))
        })?;
        anyhow::ensure!(changed > 0, "task {id} not found");
        Ok(())
    }

    pub fn delete_task(&self, id: i64) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])
                .with_context(|| format!("failed to delete task {id}"))
        })?;
        anyhow::ensure!(changed > 0, "task {id} not found");
        Ok(())
    }

    pub fn toggle_task(&self, id: i64) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET enabled = NOT enabled, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .with_context(|| format!("failed to toggle task {id}"))
        })?;
        anyhow::ensure!(changed > 0, "task {id} not found");
        Ok(())
    }
}
