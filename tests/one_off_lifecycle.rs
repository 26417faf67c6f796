//! Full one-off lifecycle against a real scheduler and a stubbed `claude`
//! binary: fires once, completes, auto-disables.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use claude_tasks::db::{RunStatus, Store, Task};
use claude_tasks::scheduler::Scheduler;
use tempfile::TempDir;

fn install_fake_claude(bin_dir: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(bin_dir).unwrap();
    let binary = bin_dir.join("claude");
    std::fs::write(&binary, "#!/bin/sh\nexit 0\n").unwrap();

    let mut perms = std::fs::metadata(&binary).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&binary, perms).unwrap();

    let path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{path}", bin_dir.display()));
}

#[tokio::test(flavor = "multi_thread")]
async fn one_off_task_runs_once_then_auto_disables() {
    std::env::set_var("CLAUDE_TASKS_DISABLE_USAGE_CHECK", "1");
    let tmp = TempDir::new().unwrap();
    install_fake_claude(&tmp.path().join("bin"));

    let store = Arc::new(Store::open(tmp.path().join("tasks.db")).unwrap());

    let mut task = Task {
        name: "x".to_string(),
        prompt: "say hello".to_string(),
        cron_expr: String::new(),
        scheduled_at: Some(Utc::now() + chrono::Duration::seconds(2)),
        working_dir: ".".to_string(),
        enabled: true,
        ..Task::default()
    };
    store.create_task(&mut task).unwrap();

    let scheduler = Scheduler::new(Arc::clone(&store), tmp.path()).await.unwrap();
    scheduler.start().await.unwrap();
    assert!(scheduler.is_leader().await);

    // The reconcile at start armed the timer; next_run_at mirrors it.
    let persisted = store.get_task(task.id).unwrap();
    assert!(persisted.next_run_at.is_some());

    tokio::time::sleep(Duration::from_secs(3)).await;

    let runs = store.get_task_runs(task.id, 10).unwrap();
    assert_eq!(runs.len(), 1, "expected exactly one run");
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert!(runs[0].ended_at.is_some());
    assert!(!runs[0].session_id.is_empty());

    let finished = store.get_task(task.id).unwrap();
    assert!(!finished.enabled, "one-off task should auto-disable");
    assert!(finished.next_run_at.is_none());
    assert!(finished.last_run_at.is_some());

    // Run-log artefact exists for the run.
    let log_dir = tmp.path().join("logs").join(task.id.to_string());
    assert_eq!(std::fs::read_dir(log_dir).unwrap().count(), 1);

    scheduler.stop().await;
}
