//! Terminal dashboard: a batch-refreshed task table with toggle and
//! run-now actions. Read queries go straight to the store; the scheduler
//! (when this process runs one) supplies projected next-fire times.

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table, TableState};
use ratatui::Terminal;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::db::{RunStatus, Store, Task};
use crate::executor::Executor;
use crate::scheduler::Scheduler;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// How the TUI decides whether to run its own scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Auto,
    On,
    Off,
}

impl SchedulerMode {
    /// `auto` starts a scheduler only when no daemon already runs one.
    pub fn should_start_scheduler(self, daemon_running: bool) -> bool {
        match self {
            SchedulerMode::Auto => !daemon_running,
            SchedulerMode::On => true,
            SchedulerMode::Off => false,
        }
    }
}

impl FromStr for SchedulerMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(SchedulerMode::Auto),
            "on" => Ok(SchedulerMode::On),
            "off" => Ok(SchedulerMode::Off),
            other => anyhow::bail!("invalid --scheduler value {other:?} (expected auto|on|off)"),
        }
    }
}

/// Coalesces refresh requests: at most one load in flight, with at most one
/// queued behind it.
#[derive(Debug, Default)]
struct RefreshGuard {
    in_flight: bool,
    pending: bool,
}

impl RefreshGuard {
    /// True when the caller should start a load now; otherwise the request
    /// is queued behind the in-flight one.
    fn try_begin(&mut self) -> bool {
        if self.in_flight {
            self.pending = true;
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Marks the in-flight load complete. True when a queued request should
    /// start immediately (the guard re-arms itself for it).
    fn complete(&mut self) -> bool {
        self.in_flight = false;
        if self.pending {
            self.pending = false;
            self.in_flight = true;
            return true;
        }
        false
    }
}

struct TaskRow {
    task: Task,
    status: Option<RunStatus>,
    running: bool,
    next_run: Option<DateTime<Utc>>,
}

struct TasksLoaded {
    rows: Vec<TaskRow>,
    error: Option<String>,
}

/// Single batch load: one task listing plus one last-run-status query;
/// running markers derive from the same batch, never per-task lookups.
async fn load_rows(store: Arc<Store>, scheduler: Option<Arc<Scheduler>>) -> Result<Vec<TaskRow>> {
    let tasks = store.list_tasks()?;
    let statuses = store.get_last_run_statuses()?;

    let scheduled_next = match &scheduler {
        Some(scheduler) => scheduler.get_all_next_run_times().await,
        None => std::collections::HashMap::new(),
    };

    Ok(tasks
        .into_iter()
        .map(|task| {
            let status = statuses.get(&task.id).copied();
            let next_run = scheduled_next.get(&task.id).copied().or(task.next_run_at);
            TaskRow {
                running: status == Some(RunStatus::Running),
                status,
                next_run,
                task,
            }
        })
        .collect())
}

struct App {
    store: Arc<Store>,
    scheduler: Option<Arc<Scheduler>>,
    executor: Arc<Executor>,
    rows: Vec<TaskRow>,
    table_state: TableState,
    refresh: RefreshGuard,
    status_line: String,
    should_quit: bool,
}

impl App {
    fn selected_task_id(&self) -> Option<i64> {
        self.table_state
            .selected()
            .and_then(|index| self.rows.get(index))
            .map(|row| row.task.id)
    }

    fn select_next(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let next = match self.table_state.selected() {
            Some(index) => (index + 1).min(self.rows.len() - 1),
            None => 0,
        };
        self.table_state.select(Some(next));
    }

    fn select_previous(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let previous = self.table_state.selected().unwrap_or(0).saturating_sub(1);
        self.table_state.select(Some(previous));
    }

    fn spawn_load(&self, tx: &mpsc::Sender<TasksLoaded>) {
        let store = Arc::clone(&self.store);
        let scheduler = self.scheduler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let loaded = match load_rows(store, scheduler).await {
                Ok(rows) => TasksLoaded { rows, error: None },
                Err(err) => TasksLoaded {
                    rows: Vec::new(),
                    error: Some(format!("load failed: {err:#}")),
                },
            };
            let _ = tx.send(loaded).await;
        });
    }

    fn request_refresh(&mut self, tx: &mpsc::Sender<TasksLoaded>) {
        if self.refresh.try_begin() {
            self.spawn_load(tx);
        }
    }

    fn apply_loaded(&mut self, loaded: TasksLoaded, tx: &mpsc::Sender<TasksLoaded>) {
        if let Some(error) = loaded.error {
            self.status_line = error;
        } else {
            self.rows = loaded.rows;
            if self.rows.is_empty() {
                self.table_state.select(None);
            } else {
                let selected = self.table_state.selected().unwrap_or(0);
                self.table_state
                    .select(Some(selected.min(self.rows.len() - 1)));
            }
        }

        if self.refresh.complete() {
            self.spawn_load(tx);
        }
    }

    async fn toggle_selected(&mut self) {
        let Some(task_id) = self.selected_task_id() else {
            return;
        };
        if let Err(err) = self.store.toggle_task(task_id) {
            self.status_line = format!("toggle failed: {err:#}");
            return;
        }
        if let Some(scheduler) = &self.scheduler {
            match self.store.get_task(task_id) {
                Ok(task) => {
                    if let Err(err) = scheduler.update_task(&task).await {
                        self.status_line = format!("reschedule failed: {err:#}");
                        return;
                    }
                }
                Err(err) => {
                    self.status_line = format!("toggle failed: {err:#}");
                    return;
                }
            }
        }
        self.status_line = format!("toggled task {task_id}");
    }

    fn run_selected(&mut self) {
        let Some(task_id) = self.selected_task_id() else {
            return;
        };
        match self.store.get_task(task_id) {
            Ok(task) => {
                let mut rx = self.executor.execute_async(task);
                tokio::spawn(async move {
                    let _ = rx.recv().await;
                });
                self.status_line = format!("dispatched task {task_id}");
            }
            Err(err) => self.status_line = format!("run failed: {err:#}"),
        }
    }
}

/// Runs the dashboard until the user quits.
pub async fn run(
    store: Arc<Store>,
    scheduler: Option<Arc<Scheduler>>,
    executor: Arc<Executor>,
) -> Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = main_loop(&mut terminal, store, scheduler, executor).await;

    terminal::disable_raw_mode()?;
    crossterm::execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn main_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    store: Arc<Store>,
    scheduler: Option<Arc<Scheduler>>,
    executor: Arc<Executor>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<TasksLoaded>(4);

    let mut app = App {
        store,
        scheduler,
        executor,
        rows: Vec::new(),
        table_state: TableState::default(),
        refresh: RefreshGuard::default(),
        status_line: "q quit · r refresh · t toggle · x run now".to_string(),
        should_quit: false,
    };

    app.request_refresh(&tx);
    let mut last_refresh = std::time::Instant::now();

    loop {
        terminal.draw(|frame| draw(frame, &mut app))?;

        if app.should_quit {
            return Ok(());
        }

        while let Ok(loaded) = rx.try_recv() {
            app.apply_loaded(loaded, &tx);
        }

        if last_refresh.elapsed() >= REFRESH_INTERVAL {
            last_refresh = std::time::Instant::now();
            app.request_refresh(&tx);
        }

        let has_event = tokio::task::block_in_place(|| event::poll(Duration::from_millis(100)))?;
        if !has_event {
            continue;
        }
        let Event::Key(key) = tokio::task::block_in_place(event::read)? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                app.should_quit = true;
            }
            KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
            KeyCode::Char('r') => app.request_refresh(&tx),
            KeyCode::Down | KeyCode::Char('j') => app.select_next(),
            KeyCode::Up | KeyCode::Char('k') => app.select_previous(),
            KeyCode::Char('t') => {
                app.toggle_selected().await;
                app.request_refresh(&tx);
            }
            KeyCode::Char('x') => {
                app.run_selected();
                app.request_refresh(&tx);
            }
            _ => {}
        }
    }
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &mut App) {
    let [table_area, status_area] =
        Layout::vertical([Constraint::Min(3), Constraint::Length(1)]).areas(frame.area());

    let header = Row::new(["ID", "Name", "Schedule", "Enabled", "Last Run", "Next Run"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = app
        .rows
        .iter()
        .map(|row| {
            let schedule = if row.task.is_one_off() {
                row.task
                    .scheduled_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "immediate".to_string())
            } else {
                row.task.cron_expr.clone()
            };

            let status = if row.running {
                "running".to_string()
            } else {
                row.status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string())
            };

            let next_run = row
                .next_run
                .map(|at| at.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());

            let style = match (row.running, row.task.enabled) {
                (true, _) => Style::default().fg(Color::Yellow),
                (false, false) => Style::default().fg(Color::DarkGray),
                _ => Style::default(),
            };

            Row::new([
                row.task.id.to_string(),
                row.task.name.clone(),
                schedule,
                if row.task.enabled { "yes" } else { "no" }.to_string(),
                status,
                next_run,
            ])
            .style(style)
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(5),
            Constraint::Min(16),
            Constraint::Length(20),
            Constraint::Length(8),
            Constraint::Length(10),
            Constraint::Length(10),
        ],
    )
    .header(header)
    .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
    .block(Block::default().borders(Borders::ALL).title("claude-tasks"));

    frame.render_stateful_widget(table, table_area, &mut app.table_state);
    frame.render_widget(Paragraph::new(app.status_line.as_str()), status_area);
}
