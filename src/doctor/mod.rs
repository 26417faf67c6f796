//! Environment and runtime diagnostics behind `claude-tasks doctor`.

use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config;
use crate::db::Store;
use crate::usage::UsageClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
    pub hint: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
            hint: String::new(),
        }
    }

    fn warn(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warn,
            detail: detail.into(),
            hint: String::new(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>, hint: &str) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
            hint: hint.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct Report {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub results: Vec<CheckResult>,
    pub critical_failures: usize,
}

impl Report {
    pub fn exit_code(&self) -> i32 {
        if self.critical_failures > 0 {
            1
        } else {
            0
        }
    }

    fn add(&mut self, result: CheckResult) {
        if result.status == CheckStatus::Fail {
            self.critical_failures += 1;
        }
        self.results.push(result);
    }
}

pub struct Runner {
    data_dir: PathBuf,
}

impl Runner {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn run(&self) -> Report {
        let mut report = Report {
            data_dir: self.data_dir.clone(),
            db_path: self.data_dir.join("tasks.db"),
            results: Vec::new(),
            critical_failures: 0,
        };

        report.add(check_claude_binary());
        report.add(check_usage_credentials());
        report.add(check_dir_writable("data_dir", &self.data_dir, "Fix CLAUDE_TASKS_DATA permissions"));
        report.add(check_dir_writable(
            "logs_dir",
            &self.data_dir.join("logs"),
            "Fix logs directory permissions",
        ));

        let db_path = report.db_path.clone();
        match check_db_writable(&db_path) {
            Ok((store, result)) => {
                report.add(result);
                report.add(check_lease_visibility(&store));
            }
            Err(result) => report.add(result),
        }

        report
    }
}

fn check_claude_binary() -> CheckResult {
    match find_in_path("claude") {
        Some(path) => CheckResult::pass("claude_binary", format!("found at {}", path.display())),
        None => CheckResult::fail(
            "claude_binary",
            "`claude` executable not found in PATH",
            "Install Claude CLI or prepend its bin directory to PATH",
        ),
    }
}

fn check_usage_credentials() -> CheckResult {
    if config::usage_check_disabled() {
        return CheckResult::pass(
            "usage_credentials",
            format!("usage check disabled via {}", config::DISABLE_USAGE_CHECK_ENV),
        );
    }

    match UsageClient::new() {
        Ok(_) => CheckResult::pass("usage_credentials", "credentials available"),
        Err(err) => CheckResult::fail(
            "usage_credentials",
            format!("usage credentials unavailable: {err:#}"),
            "Login Claude CLI or set CLAUDE_TASKS_DISABLE_USAGE_CHECK=1",
        ),
    }
}

fn check_dir_writable(name: &'static str, dir: &Path, hint: &str) -> CheckResult {
    if let Err(err) = std::fs::create_dir_all(dir) {
        return CheckResult::fail(
            name,
            format!("cannot create {}: {err}", dir.display()),
            hint,
        );
    }

    let probe = dir.join(".doctor-write-probe");
    if let Err(err) = std::fs::write(&probe, "ok") {
        return CheckResult::fail(name, format!("cannot write {}: {err}", dir.display()), hint);
    }
    let _ = std::fs::remove_file(&probe);

    CheckResult::pass(name, "writable")
}

fn check_db_writable(db_path: &Path) -> Result<(Store, CheckResult), CheckResult> {
    let store = Store::open(db_path).map_err(|err| {
        CheckResult::fail(
            "database",
            format!("cannot open DB {}: {err:#}", db_path.display()),
            "Verify database path and filesystem permissions",
        )
    })?;

    let holder_id = format!("doctor-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    if let Err(err) = store.try_acquire_lease(&holder_id, Duration::from_millis(50)) {
        return Err(CheckResult::fail(
            "database",
            format!("database write check failed: {err:#}"),
            "Verify SQLite file permissions and locks",
        ));
    }
    let _ = store.release_lease(&holder_id);

    Ok((store, CheckResult::pass("database", "open and writable")))
}

fn check_lease_visibility(store: &Store) -> CheckResult {
    match store.get_lease() {
        Err(err) => CheckResult::warn("scheduler_lease", format!("unable to read lease: {err:#}")),
        Ok(None) => CheckResult::warn("scheduler_lease", "no lease holder recorded"),
        Ok(Some(lease)) => {
            let state = if lease.is_active(Utc::now()) {
                "active"
            } else {
                "expired"
            };
            CheckResult::pass(
                "scheduler_lease",
                format!(
                    "holder={} lease_expires_at={} ({state})",
                    lease.holder_id,
                    lease.lease_expires_at.to_rfc3339()
                ),
            )
        }
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
