//! Runs tasks as `claude` CLI child processes: pre-flight usage gate,
//! bounded output capture, run-record persistence, log artefacts, and
//! webhook notifications.

mod buffer;

use anyhow::{anyhow, Context};
use chrono::Utc;
use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::config;
use crate::db::{RunStatus, Store, Task, TaskRun, DEFAULT_PERMISSION_MODE};
use crate::logger::RunLogger;
use crate::usage::UsageClient;
use crate::webhook::{Discord, Slack};

use buffer::{CappedBuffer, MAX_CAPTURED_OUTPUT_BYTES};

/// Hard deadline for a single run; the child is killed when it elapses.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const CLAUDE_BINARY: &str = "claude";

/// Outcome of one execution attempt.
pub struct ExecutionResult {
    pub output: String,
    pub error: Option<anyhow::Error>,
    pub duration: Duration,
    pub skipped: bool,
    pub skip_reason: String,
}

impl ExecutionResult {
    fn from_error(error: anyhow::Error) -> Self {
        Self {
            output: String::new(),
            error: Some(error),
            duration: Duration::ZERO,
            skipped: false,
            skip_reason: String::new(),
        }
    }
}

/// Executes tasks against the Claude CLI. Holds the usage gate (or the
/// error from constructing it, for fail-closed enforcement).
pub struct Executor {
    store: Arc<Store>,
    logger: RunLogger,
    discord: Discord,
    slack: Slack,
    usage_client: Option<UsageClient>,
    usage_client_err: Option<anyhow::Error>,
    disable_usage_check: bool,
}

impl Executor {
    pub fn new(store: Arc<Store>, data_dir: impl AsRef<Path>) -> Self {
        let disable_usage_check = config::usage_check_disabled();
        let (usage_client, usage_client_err) = if disable_usage_check {
            (None, None)
        } else {
            match UsageClient::new() {
                Ok(client) => (Some(client), None),
                Err(err) => (None, Some(err)),
            }
        };

        Self {
            store,
            logger: RunLogger::new(data_dir),
            discord: Discord::new(),
            slack: Slack::new(),
            usage_client,
            usage_client_err,
            disable_usage_check,
        }
    }

    /// Executor with an explicit usage gate; lets tests inject a mock
    /// client or a retained construction error.
    pub fn with_usage_gate(
        store: Arc<Store>,
        data_dir: impl AsRef<Path>,
        usage_client: Option<UsageClient>,
        usage_client_err: Option<anyhow::Error>,
    ) -> Self {
        Self {
            store,
            logger: RunLogger::new(data_dir),
            discord: Discord::new(),
            slack: Slack::new(),
            usage_client,
            usage_client_err,
            disable_usage_check: false,
        }
    }

    pub fn usage_check_disabled(&self) -> bool {
        self.disable_usage_check
    }

    /// Runs `task` to completion, returning its result. Every observable
    /// side effect (run row, log artefact, webhooks) happens in here.
    pub async fn execute(&self, task: &Task) -> ExecutionResult {
        let started_at = Utc::now();
        let start = std::time::Instant::now();

        if !self.disable_usage_check {
            // Fail closed: no usage gate means no execution, and the caller
            // learns why. Nothing is persisted for an unanswerable check.
            let client = match &self.usage_client {
                Some(client) => client,
                None => {
                    let error = match &self.usage_client_err {
                        Some(cause) => {
                            anyhow!("usage threshold enforcement unavailable: {cause:#}")
                        }
                        None => anyhow!("usage threshold enforcement unavailable"),
                    };
                    return ExecutionResult::from_error(error);
                }
            };

            let threshold = match self.store.get_usage_threshold() {
                Ok(threshold) => threshold,
                Err(err) => {
                    return ExecutionResult::from_error(
                        err.context("failed to enforce usage threshold"),
                    );
                }
            };

            let (below, snapshot) = match client.check_threshold(threshold).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    return ExecutionResult::from_error(
                        err.context("failed to enforce usage threshold"),
                    );
                }
            };

            if !below {
                let skip_reason = format!(
                    "Usage above threshold ({threshold:.0}%): 5h={:.0}%, 7d={:.0}%. Resets in {}",
                    snapshot.five_hour.utilization,
                    snapshot.seven_day.utilization,
                    snapshot.format_time_until_reset()
                );

                let mut run = TaskRun {
                    task_id: task.id,
                    started_at,
                    ended_at: Some(Utc::now()),
                    status: RunStatus::Failed,
                    error: skip_reason.clone(),
                    ..TaskRun::default()
                };
                if let Err(err) = self.store.create_task_run(&mut run) {
                    return ExecutionResult::from_error(
                        err.context("failed to create skipped run record"),
                    );
                }

                let log_err = self
                    .logger
                    .write_run_log(task, &run)
                    .context("failed to write run log")
                    .err();

                return ExecutionResult {
                    output: String::new(),
                    error: log_err,
                    duration: start.elapsed(),
                    skipped: true,
                    skip_reason,
                };
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let args = build_args(task, &session_id);

        let mut run = TaskRun {
            task_id: task.id,
            started_at,
            status: RunStatus::Running,
            session_id: session_id.clone(),
            ..TaskRun::default()
        };
        if let Err(err) = self.store.create_task_run(&mut run) {
            return ExecutionResult::from_error(err.context("failed to create run record"));
        }

        let (stdout, stderr, exec_err) = run_claude(task, &args).await;

        let duration = start.elapsed();
        run.ended_at = Some(Utc::now());
        run.output = stdout.clone();
        match &exec_err {
            Some(err) => {
                run.status = RunStatus::Failed;
                run.error = format!("{err:#}\n{stderr}");
            }
            None => run.status = RunStatus::Completed,
        }

        let mut post_run_errs = Vec::new();
        if let Err(err) = self.store.update_task_run(&run) {
            post_run_errs.push(err.context("failed to update run record"));
        }

        if let Err(err) = self.logger.write_run_log(task, &run) {
            post_run_errs.push(err.context("failed to write run log"));
        }

        if let Some(ended_at) = run.ended_at {
            if let Err(err) = self.store.update_task_last_run(task.id, ended_at) {
                post_run_errs.push(err.context("failed to update task last run time"));
            }
        }

        if !task.discord_webhook.is_empty() {
            if let Err(err) = self.discord.send_result(&task.discord_webhook, task, &run).await {
                post_run_errs.push(err.context("failed to send discord webhook"));
            }
        }
        if !task.slack_webhook.is_empty() {
            if let Err(err) = self.slack.send_result(&task.slack_webhook, task, &run).await {
                post_run_errs.push(err.context("failed to send slack webhook"));
            }
        }

        let mut result_errs = Vec::new();
        if let Some(err) = exec_err {
            result_errs.push(anyhow!("{err:#}: {stderr}"));
        }
        result_errs.extend(post_run_errs);

        ExecutionResult {
            output: stdout,
            error: join_errors(result_errs),
            duration,
            skipped: false,
            skip_reason: String::new(),
        }
    }

    /// Dispatches `task` on a background worker and hands back a size-1
    /// channel carrying the eventual result.
    pub fn execute_async(self: &Arc<Self>, task: Task) -> mpsc::Receiver<ExecutionResult> {
        let (tx, rx) = mpsc::channel(1);
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let result = executor.execute(&task).await;
            if tx.send(result).await.is_err() {
                warn!(task_id = task.id, "execution result receiver dropped");
            }
        });
        rx
    }
}

/// Builds the CLI argument list: print mode, permission flags, optional
/// model, session id, then the prompt as the final positional.
fn build_args(task: &Task, session_id: &str) -> Vec<String> {
    let mut args = vec!["-p".to_string()];

    let mut perm_mode = task.permission_mode.as_str();
    if perm_mode.is_empty() {
        perm_mode = DEFAULT_PERMISSION_MODE;
    }
    if perm_mode == "bypassPermissions" {
        args.push("--dangerously-skip-permissions".to_string());
    } else if perm_mode != DEFAULT_PERMISSION_MODE {
        args.push("--permission-mode".to_string());
        args.push(perm_mode.to_string());
    }

    if !task.model.is_empty() {
        args.push("--model".to_string());
        args.push(task.model.clone());
    }

    args.push("--session-id".to_string());
    args.push(session_id.to_string());
    args.push(task.prompt.clone());

    args
}

/// Spawns the claude binary, drains stdout/stderr into capped buffers, and
/// waits for exit under the run deadline.
async fn run_claude(task: &Task, args: &[String]) -> (String, String, Option<anyhow::Error>) {
    let mut stdout_buf = CappedBuffer::new(MAX_CAPTURED_OUTPUT_BYTES);
    let mut stderr_buf = CappedBuffer::new(MAX_CAPTURED_OUTPUT_BYTES);

    let mut child = match tokio::process::Command::new(CLAUDE_BINARY)
        .args(args)
        .current_dir(&task.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return (
                String::new(),
                String::new(),
                Some(anyhow!(err).context("failed to spawn claude")),
            );
        }
    };

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let wait = async {
        let (_, _, status) = tokio::join!(
            drain(stdout_pipe, &mut stdout_buf),
            drain(stderr_pipe, &mut stderr_buf),
            child.wait(),
        );
        status
    };

    let exec_err = match tokio::time::timeout(RUN_TIMEOUT, wait).await {
        Ok(Ok(status)) if status.success() => None,
        Ok(Ok(status)) => Some(anyhow!("{status}")),
        Ok(Err(err)) => Some(anyhow!(err).context("failed to wait for claude")),
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!(task_id = task.id, "failed to kill timed out child: {err}");
            }
            Some(anyhow!(
                "run exceeded {} minute deadline and was killed",
                RUN_TIMEOUT.as_secs() / 60
            ))
        }
    };

    (stdout_buf.render(), stderr_buf.render(), exec_err)
}

async fn drain(pipe: Option<impl AsyncReadExt + Unpin>, buf: &mut CappedBuffer) {
    let Some(mut pipe) = pipe else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = buf.write_all(&chunk[..n]);
            }
        }
    }
}

fn join_errors(errs: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    let mut iter = errs.into_iter();
    let first = iter.next()?;
    let mut message = format!("{first:#}");
    for err in iter {
        message.push_str("; ");
        message.push_str(&format!("{err:#}"));
    }
    Some(anyhow!(message))
}
