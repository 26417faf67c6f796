//! Structured JSON artefacts for completed runs, one file per run under
//! `<data_dir>/logs/<task_id>/`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::db::{Task, TaskRun};

#[derive(Debug, Serialize)]
struct RunLog<'a> {
    run_id: i64,
    task_id: i64,
    task_name: &'a str,
    prompt: &'a str,
    working_dir: &'a str,
    cron_expr: &'a str,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: i64,
    status: &'a str,
    output: &'a str,
    error: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    model: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    permission_mode: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    session_id: &'a str,
}

/// Writes run-log artefacts under a fixed base directory.
pub struct RunLogger {
    base_dir: PathBuf,
}

impl RunLogger {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("logs"),
        }
    }

    /// Serialises `run` to `<base>/<task_id>/<run_id>_<status>_<ts>.json`,
    /// creating directories on demand. Distinct run ids never collide.
    pub fn write_run_log(&self, task: &Task, run: &TaskRun) -> Result<PathBuf> {
        let task_dir = self.base_dir.join(task.id.to_string());
        std::fs::create_dir_all(&task_dir)
            .with_context(|| format!("failed to create log dir: {}", task_dir.display()))?;

        let duration_ms = run
            .ended_at
            .map(|ended| (ended - run.started_at).num_milliseconds())
            .unwrap_or(0);

        let entry = RunLog {
            run_id: run.id,
            task_id: task.id,
            task_name: &task.name,
            prompt: &task.prompt,
            working_dir: &task.working_dir,
            cron_expr: &task.cron_expr,
            started_at: run.started_at,
            ended_at: run.ended_at,
            duration_ms,
            status: run.status.as_str(),
            output: &run.output,
            error: &run.error,
            model: &task.model,
            permission_mode: &task.permission_mode,
            session_id: &run.session_id,
        };

        let data = serde_json::to_string_pretty(&entry).context("failed to marshal run log")?;

        let timestamp = run.started_at.format("%Y%m%dT%H%M%S");
        let filename = format!("{}_{}_{}.json", run.id, run.status.as_str(), timestamp);
        let file_path = task_dir.join(filename);

        std::fs::write(&file_path, data)
            .with_context(|| format!("failed to write log file: {}", file_path.display()))?;

        Ok(file_path)
    }
}
