use anyhow::{Context, Result};
use directories::UserDirs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CLAUDE_TASKS_DATA";
/// Truthy value disables the pre-flight usage gate entirely.
pub const DISABLE_USAGE_CHECK_ENV: &str = "CLAUDE_TASKS_DISABLE_USAGE_CHECK";
/// When set, all API routes except health require this bearer token.
pub const AUTH_TOKEN_ENV: &str = "CLAUDE_TASKS_AUTH_TOKEN";
/// When set, restricts CORS to this single origin.
pub const CORS_ORIGIN_ENV: &str = "CLAUDE_TASKS_CORS_ORIGIN";
/// Caps concurrent run-now dispatches; 0 disables the endpoint.
pub const RUN_CONCURRENCY_ENV: &str = "CLAUDE_TASKS_RUN_CONCURRENCY";

pub const DEFAULT_RUN_CONCURRENCY: usize = 4;

/// Well-known locations inside the data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
}

impl Paths {
    /// Resolves the data directory from `CLAUDE_TASKS_DATA`, falling back to
    /// `~/.claude-tasks`.
    pub fn resolve() -> Result<Self> {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            let dir = dir.trim();
            if !dir.is_empty() {
                return Ok(Self {
                    data_dir: PathBuf::from(dir),
                });
            }
        }

        let user_dirs = UserDirs::new().context("could not determine home directory")?;
        Ok(Self {
            data_dir: user_dirs.home_dir().join(".claude-tasks"),
        })
    }

    pub fn from_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn ensure_data_dir(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("failed to create data directory: {}", self.data_dir.display())
        })?;
        Ok(&self.data_dir)
    }
}

/// Shared truthiness parsing for env flags: `1`, `true`, `yes`, `on`.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn usage_check_disabled() -> bool {
    std::env::var(DISABLE_USAGE_CHECK_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

pub fn run_concurrency() -> usize {
    std::env::var(RUN_CONCURRENCY_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_RUN_CONCURRENCY)
}
