#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use claude_tasks::api::{self, ApiConfig, AppState};
use claude_tasks::config::{self, Paths};
use claude_tasks::daemon::{self, PidFileGuard};
use claude_tasks::db::Store;
use claude_tasks::doctor;
use claude_tasks::executor::Executor;
use claude_tasks::scheduler::Scheduler;
use claude_tasks::tui::{self, SchedulerMode};
use claude_tasks::upgrade;
use claude_tasks::version;

/// Schedule and run Claude CLI tasks via cron.
#[derive(Parser, Debug)]
#[command(name = "claude-tasks", version = version::VERSION)]
#[command(about = "Schedule and run Claude CLI tasks via cron", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the interactive TUI (the default command)
    Tui {
        /// Scheduler mode: auto starts one iff no daemon is running
        #[arg(long, default_value = "auto")]
        scheduler: String,
    },

    /// Run the background scheduler daemon
    Daemon {
        /// Enable the scheduler loop
        #[arg(long, default_value_t = true)]
        scheduler: bool,
    },

    /// Run the HTTP API server
    Serve {
        /// HTTP server port
        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// Enable the scheduler loop
        #[arg(long, default_value_t = true)]
        scheduler: bool,
    },

    /// Run environment and runtime diagnostics
    Doctor,

    /// Show version information
    Version,

    /// Upgrade to the latest released version
    Upgrade,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    let cli = Cli::parse();
    match cli.command {
        None => run_tui("auto").await,
        Some(Commands::Tui { scheduler }) => run_tui(&scheduler).await,
        Some(Commands::Daemon { scheduler }) => run_daemon(scheduler).await,
        Some(Commands::Serve { port, scheduler }) => run_serve(port, scheduler).await,
        Some(Commands::Doctor) => run_doctor(),
        Some(Commands::Version) => {
            println!("{}", version::info());
            Ok(())
        }
        Some(Commands::Upgrade) => upgrade::upgrade().await,
    }
}

fn open_store(paths: &Paths) -> Result<Arc<Store>> {
    paths.ensure_data_dir()?;
    Ok(Arc::new(
        Store::open(paths.db_path()).context("failed to initialize database")?,
    ))
}

async fn run_tui(scheduler_mode: &str) -> Result<()> {
    let mode: SchedulerMode = scheduler_mode.parse()?;

    let paths = Paths::resolve()?;
    let store = open_store(&paths)?;

    let daemon_pid = daemon::daemon_running(&paths.pid_path());
    let start_scheduler = mode.should_start_scheduler(daemon_pid.is_some());

    let scheduler = if start_scheduler {
        let scheduler = Scheduler::new(Arc::clone(&store), &paths.data_dir).await?;
        scheduler.start().await.context("failed to start scheduler")?;
        Some(scheduler)
    } else {
        if let Some(pid) = daemon_pid {
            println!("Daemon running (PID {pid}), TUI in client mode");
        }
        None
    };

    let executor = Arc::new(Executor::new(Arc::clone(&store), &paths.data_dir));
    let result = tui::run(store, scheduler.clone(), executor).await;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    result
}

async fn run_daemon(scheduler_enabled: bool) -> Result<()> {
    let paths = Paths::resolve()?;

    if let Some(pid) = daemon::daemon_running(&paths.pid_path()) {
        anyhow::bail!("daemon already running (PID {pid})");
    }

    let store = open_store(&paths)?;
    let _pid_guard = PidFileGuard::acquire(&paths.pid_path())?;

    let scheduler = if scheduler_enabled {
        let scheduler = Scheduler::new(Arc::clone(&store), &paths.data_dir).await?;
        scheduler.start().await.context("failed to start scheduler")?;
        println!(
            "Daemon scheduler: enabled (leader={})",
            scheduler.is_leader().await
        );
        Some(scheduler)
    } else {
        println!("Daemon scheduler: disabled");
        None
    };

    println!("claude-tasks daemon started");
    println!("PID: {}", std::process::id());
    println!("Database: {}", paths.db_path().display());

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    println!("\nShutting down...");
    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    Ok(())
}

async fn run_serve(port: u16, scheduler_enabled: bool) -> Result<()> {
    let paths = Paths::resolve()?;
    let store = open_store(&paths)?;

    let scheduler = if scheduler_enabled {
        let scheduler = Scheduler::new(Arc::clone(&store), &paths.data_dir).await?;
        scheduler.start().await.context("failed to start scheduler")?;
        println!(
            "Serve scheduler: enabled (leader={})",
            scheduler.is_leader().await
        );
        Some(scheduler)
    } else {
        println!("Serve scheduler: disabled");
        None
    };

    println!("claude-tasks API server starting on :{port}");
    println!("Database: {}", paths.db_path().display());

    let state = AppState::new(
        Arc::clone(&store),
        scheduler.clone(),
        &paths.data_dir,
        config::run_concurrency(),
    );
    let result = api::serve(state, &ApiConfig::from_env(), port).await;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    result
}

fn run_doctor() -> Result<()> {
    let paths = Paths::resolve()?;
    let report = doctor::Runner::new(&paths.data_dir).run();

    println!("claude-tasks doctor");
    println!("Data directory: {}", report.data_dir.display());
    println!("Database path: {}", report.db_path.display());
    for result in &report.results {
        println!("[{}] {}: {}", result.status, result.name, result.detail);
        if !result.hint.is_empty() {
            println!("  hint: {}", result.hint);
        }
    }

    if report.critical_failures > 0 {
        anyhow::bail!("doctor found {} critical issue(s)", report.critical_failures);
    }

    println!("Doctor checks passed");
    Ok(())
}
