//! Daemon PID-file lifecycle. Liveness is probed with a null signal so a
//! leftover file from a crashed daemon never blocks the next start.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub fn write_pid_file(pid_path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create pid directory: {}", parent.display()))?;
    }
    std::fs::write(pid_path, pid.to_string())
        .with_context(|| format!("failed to write pid file: {}", pid_path.display()))
}

pub fn read_pid(pid_path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(pid_path).ok()?;
    raw.trim().parse().ok()
}

/// Returns the daemon PID when the file names a live process; a stale or
/// unreadable file reads as "not running".
pub fn daemon_running(pid_path: &Path) -> Option<u32> {
    let pid = read_pid(pid_path)?;
    process_alive(pid).then_some(pid)
}

fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Removes the pid file when dropped, so clean exits and error paths both
/// leave no stale file behind.
pub struct PidFileGuard {
    pid_path: PathBuf,
}

impl PidFileGuard {
    pub fn acquire(pid_path: &Path) -> Result<Self> {
        write_pid_file(pid_path, std::process::id())?;
        Ok(Self {
            pid_path: pid_path.to_path_buf(),
        })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pid_round_trips_through_file() {
        let tmp = TempDir::new().unwrap();
        let pid_path = tmp.path().join("daemon.pid");

        write_pid_file(&pid_path, 12345).unwrap();
        assert_eq!(read_pid(&pid_path), Some(12345));
    }

    #[test]
    fn missing_or_garbage_file_reads_as_not_running() {
        let tmp = TempDir::new().unwrap();
        let pid_path = tmp.path().join("daemon.pid");

        assert_eq!(daemon_running(&pid_path), None);

        std::fs::write(&pid_path, "not-a-pid").unwrap();
        assert_eq!(daemon_running(&pid_path), None);
    }

    #[test]
    fn own_process_reads_as_running() {
        let tmp = TempDir::new().unwrap();
        let pid_path = tmp.path().join("daemon.pid");

        write_pid_file(&pid_path, std::process::id()).unwrap();
        assert_eq!(daemon_running(&pid_path), Some(std::process::id()));
    }

    #[test]
    fn stale_pid_reads_as_not_running() {
        let tmp = TempDir::new().unwrap();
        let pid_path = tmp.path().join("daemon.pid");

        // PIDs near the default pid_max are vanishingly unlikely to be live.
        write_pid_file(&pid_path, 4_194_000).unwrap();
        assert_eq!(daemon_running(&pid_path), None);
    }

    #[test]
    fn guard_removes_file_on_drop() {
        let tmp = TempDir::new().unwrap();
        let pid_path = tmp.path().join("daemon.pid");

        {
            let _guard = PidFileGuard::acquire(&pid_path).unwrap();
            assert!(pid_path.exists());
        }
        assert!(!pid_path.exists());
    }
}
