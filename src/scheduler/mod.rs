//! Lease-coordinated scheduler. Any process may start one; only the current
//! lease holder keeps an in-memory schedule and dispatches firings, while
//! everyone else answers read queries from the store and waits to take over.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Store, Task};
use crate::executor::Executor;

pub const LEASE_TTL: Duration = Duration::from_secs(15);
pub const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);
pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Mutable scheduler state; everything in here changes only under the lock.
/// Lock holders stick to map bookkeeping, with one sanctioned exception:
/// reconciliation persists next-run projections while holding the lock.
struct SchedState {
    /// task id -> cron engine entry id
    jobs: HashMap<i64, Uuid>,
    /// task id -> last seen cron expression, to detect edits
    cron_exprs: HashMap<i64, String>,
    /// task id -> armed one-off timer
    one_offs: HashMap<i64, JoinHandle<()>>,
    is_leader: bool,
    running: bool,
    stop_tx: Option<watch::Sender<bool>>,
    sync_done: Option<JoinHandle<()>>,
}

impl SchedState {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            cron_exprs: HashMap::new(),
            one_offs: HashMap::new(),
            is_leader: false,
            running: false,
            stop_tx: None,
            sync_done: None,
        }
    }
}

pub struct Scheduler {
    store: Arc<Store>,
    executor: Arc<Executor>,
    /// Engine handle; replaced with a fresh engine on every start because
    /// shutdown is terminal for the underlying scheduler.
    cron: std::sync::Mutex<JobScheduler>,
    state: Arc<RwLock<SchedState>>,
    holder_id: String,
    lease_ttl: Duration,
    renew_interval: Duration,
    sync_interval: Duration,
}

impl Scheduler {
    pub async fn new(store: Arc<Store>, data_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::with_timing(store, data_dir, LEASE_TTL, LEASE_RENEW_INTERVAL, SYNC_INTERVAL).await
    }

    /// Scheduler with explicit lease timings; integration tests shrink them
    /// to exercise leadership churn quickly.
    pub async fn with_timing(
        store: Arc<Store>,
        data_dir: impl AsRef<Path>,
        lease_ttl: Duration,
        renew_interval: Duration,
        sync_interval: Duration,
    ) -> Result<Arc<Self>> {
        let cron = JobScheduler::new()
            .await
            .map_err(|e| anyhow!("failed to create cron engine: {e}"))?;

        let holder_id = format!(
            "scheduler-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        let executor = Arc::new(Executor::new(Arc::clone(&store), data_dir));

        Ok(Arc::new(Self {
            store,
            executor,
            cron: std::sync::Mutex::new(cron),
            state: Arc::new(RwLock::new(SchedState::new())),
            holder_id,
            lease_ttl,
            renew_interval,
            sync_interval,
        }))
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn cron(&self) -> JobScheduler {
        self.cron
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Starts the cron engine and the leadership/sync loops. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let stop_rx = {
            let mut state = self.state.write().await;
            if state.running {
                return Ok(());
            }
            state.running = true;
            let (stop_tx, stop_rx) = watch::channel(false);
            state.stop_tx = Some(stop_tx);
            stop_rx
        };

        // The previous engine (if any) was shut down by stop(); shutdown is
        // terminal, so every start gets a fresh engine.
        let engine = JobScheduler::new()
            .await
            .map_err(|e| anyhow!("failed to create cron engine: {e}"))?;
        engine
            .start()
            .await
            .map_err(|e| anyhow!("failed to start cron engine: {e}"))?;
        *self
            .cron
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = engine;

        self.refresh_leadership().await;
        self.sync_tasks().await;

        let handle = self.spawn_sync_loop(stop_rx);
        self.state.write().await.sync_done = Some(handle);

        Ok(())
    }

    /// Stops the loops, clears local schedules, and releases the lease when
    /// this process held it. Idempotent.
    pub async fn stop(&self) {
        let (was_leader, stop_tx, sync_done) = {
            let mut state = self.state.write().await;
            if !state.running {
                return;
            }
            state.running = false;
            let was_leader = state.is_leader;
            state.is_leader = false;
            self.clear_schedules_locked(&mut state).await;
            (was_leader, state.stop_tx.take(), state.sync_done.take())
        };

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        if let Some(sync_done) = sync_done {
            let _ = sync_done.await;
        }

        if was_leader {
            if let Err(err) = self.store.release_lease(&self.holder_id) {
                warn!("failed to release scheduler lease: {err:#}");
            }
        }

        let mut cron = self.cron();
        if let Err(err) = cron.shutdown().await {
            warn!("failed to shut down cron engine: {err}");
        }
    }

    /// Schedules `task` locally when this process currently leads; a no-op
    /// otherwise (the next reconcile picks it up after promotion).
    pub async fn add_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.is_leader {
            return Ok(());
        }
        self.schedule_task_locked(&mut state, task).await
    }

    /// Drops any local schedule entry for the task. Safe on non-leaders.
    pub async fn remove_task(&self, task_id: i64) {
        let mut state = self.state.write().await;
        self.remove_task_locked(&mut state, task_id).await;
    }

    pub async fn update_task(&self, task: &Task) -> Result<()> {
        self.remove_task(task.id).await;
        if task.enabled {
            return self.add_task(task).await;
        }
        Ok(())
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.is_leader
    }

    /// Next firing instant for a task: the cron entry's projection, or the
    /// persisted `next_run_at` for one-offs (timers expose no deadline).
    pub async fn get_next_run_time(&self, task_id: i64) -> Option<DateTime<Utc>> {
        let state = self.state.read().await;

        if let Some(entry_id) = state.jobs.get(&task_id) {
            let mut cron = self.cron();
            if let Ok(Some(next)) = cron.next_tick_for_job(*entry_id).await {
                return Some(next);
            }
        }

        if state.one_offs.contains_key(&task_id) {
            if let Ok(task) = self.store.get_task(task_id) {
                return task.next_run_at;
            }
        }

        None
    }

    pub async fn get_all_next_run_times(&self) -> HashMap<i64, DateTime<Utc>> {
        let state = self.state.read().await;
        let mut result = HashMap::new();

        let mut cron = self.cron();
        for (task_id, entry_id) in &state.jobs {
            if let Ok(Some(next)) = cron.next_tick_for_job(*entry_id).await {
                result.insert(*task_id, next);
            }
        }

        for task_id in state.one_offs.keys() {
            if let Ok(task) = self.store.get_task(*task_id) {
                if let Some(next) = task.next_run_at {
                    result.insert(*task_id, next);
                }
            }
        }

        result
    }

    /// Dispatches a task immediately regardless of leadership; an explicit
    /// user action rather than a scheduled firing.
    pub async fn run_task_now(&self, task_id: i64) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .context("task not found")?;

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let mut rx = executor.execute_async(task);
            if let Some(result) = rx.recv().await {
                if let Some(err) = result.error {
                    warn!(task_id, "failed to execute task: {err:#}");
                }
            }
        });

        Ok(())
    }

    fn spawn_sync_loop(self: &Arc<Self>, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let renew_interval = self.renew_interval;
        let sync_interval = self.sync_interval;

        tokio::spawn(async move {
            let mut leadership_ticker = tokio::time::interval(renew_interval);
            let mut sync_ticker = tokio::time::interval(sync_interval);
            // Consume the immediate first ticks; start() already refreshed
            // and synced once.
            leadership_ticker.tick().await;
            sync_ticker.tick().await;

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            return;
                        }
                    }
                    _ = leadership_ticker.tick() => {
                        let Some(scheduler) = weak.upgrade() else { return };
                        scheduler.refresh_leadership().await;
                    }
                    _ = sync_ticker.tick() => {
                        let Some(scheduler) = weak.upgrade() else { return };
                        scheduler.refresh_leadership().await;
                        scheduler.sync_tasks().await;
                    }
                }
            }
        })
    }

    /// Contends for the lease and applies any leadership transition. A
    /// demoted leader drops all schedules under the same lock firings use,
    /// so at most one firing can slip through per missed demotion.
    async fn refresh_leadership(self: &Arc<Self>) {
        let (acquired, lease) = match self.store.try_acquire_lease(&self.holder_id, self.lease_ttl)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("failed to refresh scheduler lease: {err:#}");
                return;
            }
        };

        let mut gained = false;
        let mut lost = false;
        {
            let mut state = self.state.write().await;
            if !state.running {
                return;
            }
            if acquired && !state.is_leader {
                state.is_leader = true;
                gained = true;
            } else if !acquired && state.is_leader {
                state.is_leader = false;
                self.clear_schedules_locked(&mut state).await;
                lost = true;
            }
        }

        if gained {
            info!(holder = %self.holder_id, "scheduler leadership acquired");
            self.sync_tasks().await;
        } else if lost {
            let active_holder = lease
                .map(|l| l.holder_id)
                .unwrap_or_else(|| "unknown".to_string());
            info!(
                holder = %self.holder_id,
                active_holder = %active_holder,
                "scheduler leadership lost"
            );
        }
    }

    /// Reconciles the local schedule map against the store. Leader only.
    pub async fn sync_tasks(self: &Arc<Self>) {
        if !self.state.read().await.is_leader {
            return;
        }

        let tasks = match self.store.list_tasks() {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!("failed to sync tasks from store: {err:#}");
                return;
            }
        };

        let mut state = self.state.write().await;
        if !state.is_leader {
            return;
        }

        let db_ids: HashSet<i64> = tasks.iter().map(|t| t.id).collect();

        // Drop local entries whose tasks no longer exist.
        let stale: Vec<i64> = state
            .jobs
            .keys()
            .chain(state.one_offs.keys())
            .filter(|id| !db_ids.contains(id))
            .copied()
            .collect();
        for task_id in stale {
            self.remove_task_locked(&mut state, task_id).await;
        }

        for task in &tasks {
            let has_cron_job = state.jobs.contains_key(&task.id);
            let has_one_off = state.one_offs.contains_key(&task.id);
            let is_scheduled = has_cron_job || has_one_off;
            let old_cron_expr = state.cron_exprs.get(&task.id).cloned().unwrap_or_default();

            if task.enabled && !is_scheduled {
                if let Err(err) = self.schedule_task_locked(&mut state, task).await {
                    warn!(task_id = task.id, "failed to schedule task during sync: {err:#}");
                }
            } else if !task.enabled && is_scheduled {
                self.remove_task_locked(&mut state, task.id).await;
            } else if task.enabled && has_cron_job && task.is_one_off() {
                // Converted from recurring to one-off.
                self.remove_task_locked(&mut state, task.id).await;
                if let Err(err) = self.schedule_task_locked(&mut state, task).await {
                    warn!(task_id = task.id, "failed to reschedule task during sync: {err:#}");
                }
            } else if task.enabled && has_one_off && !task.is_one_off() {
                // Converted from one-off to recurring.
                self.remove_task_locked(&mut state, task.id).await;
                if let Err(err) = self.schedule_task_locked(&mut state, task).await {
                    warn!(task_id = task.id, "failed to reschedule task during sync: {err:#}");
                }
            } else if task.enabled && has_cron_job && task.cron_expr != old_cron_expr {
                if let Err(err) = self.schedule_task_locked(&mut state, task).await {
                    warn!(task_id = task.id, "failed to reschedule task during sync: {err:#}");
                }
            }
        }
    }

    async fn schedule_task_locked(
        &self,
        state: &mut RwLockWriteGuard<'_, SchedState>,
        task: &Task,
    ) -> Result<()> {
        if task.is_one_off() {
            return self.schedule_one_off_locked(state, task).await;
        }

        // Replace any existing entry for this task.
        if let Some(entry_id) = state.jobs.remove(&task.id) {
            let _ = self.cron().remove(&entry_id).await;
            state.cron_exprs.remove(&task.id);
        }

        let task_id = task.id;
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let shared_state = Arc::clone(&self.state);

        let job = Job::new_async(task.cron_expr.as_str(), move |entry_id, mut engine| {
            let store = Arc::clone(&store);
            let executor = Arc::clone(&executor);
            let shared_state = Arc::clone(&shared_state);

            Box::pin(async move {
                // Leadership is checked under the read lock, then released
                // before any I/O.
                if !shared_state.read().await.is_leader {
                    return;
                }

                let fresh_task = match store.get_task(task_id) {
                    Ok(task) => task,
                    Err(err) => {
                        warn!(task_id, "failed to load task for firing: {err:#}");
                        return;
                    }
                };
                if !fresh_task.enabled {
                    return;
                }

                let run_task = fresh_task.clone();
                let run_executor = Arc::clone(&executor);
                tokio::spawn(async move {
                    let mut rx = run_executor.execute_async(run_task);
                    if let Some(result) = rx.recv().await {
                        if let Some(err) = result.error {
                            warn!(task_id, "failed to execute task: {err:#}");
                        }
                    }
                });

                // Project the next firing back into the store.
                if let Ok(Some(next)) = engine.next_tick_for_job(entry_id).await {
                    if let Err(err) = store.update_task_next_run(task_id, Some(next)) {
                        warn!(task_id, "failed to update next run time: {err:#}");
                    }
                }
            })
        })
        .map_err(|e| anyhow!("invalid cron expression: {e}"))?;

        let mut cron = self.cron();
        let entry_id = cron
            .add(job)
            .await
            .map_err(|e| anyhow!("failed to register cron job: {e}"))?;

        state.jobs.insert(task.id, entry_id);
        state.cron_exprs.insert(task.id, task.cron_expr.clone());

        // Persist the projected next run; roll the entry back if the write
        // fails so we never display a firing we cannot record.
        if let Ok(Some(next)) = cron.next_tick_for_job(entry_id).await {
            if let Err(err) = self.store.update_task_next_run(task.id, Some(next)) {
                let _ = cron.remove(&entry_id).await;
                state.jobs.remove(&task.id);
                state.cron_exprs.remove(&task.id);
                return Err(err.context("failed to persist next run time"));
            }
        }

        Ok(())
    }

    async fn schedule_one_off_locked(
        &self,
        state: &mut RwLockWriteGuard<'_, SchedState>,
        task: &Task,
    ) -> Result<()> {
        if let Some(timer) = state.one_offs.remove(&task.id) {
            timer.abort();
        }

        let task_id = task.id;

        let delay = match task.scheduled_at {
            None => None,
            Some(scheduled_at) => {
                let delay = (scheduled_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                (delay > Duration::ZERO).then_some(delay)
            }
        };

        // No future instant: fire immediately off-lock.
        let Some(delay) = delay else {
            let store = Arc::clone(&self.store);
            let executor = Arc::clone(&self.executor);
            let shared_state = Arc::clone(&self.state);
            tokio::spawn(async move {
                fire_one_off(store, executor, shared_state, task_id).await;
            });
            return Ok(());
        };

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let shared_state = Arc::clone(&self.state);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire_one_off(store, executor, Arc::clone(&shared_state), task_id).await;
            shared_state.write().await.one_offs.remove(&task_id);
        });
        state.one_offs.insert(task.id, timer);

        if let Err(err) = self.store.update_task_next_run(task.id, task.scheduled_at) {
            if let Some(timer) = state.one_offs.remove(&task.id) {
                timer.abort();
            }
            return Err(err.context("failed to persist one-off next run time"));
        }

        Ok(())
    }

    async fn remove_task_locked(
        &self,
        state: &mut RwLockWriteGuard<'_, SchedState>,
        task_id: i64,
    ) {
        if let Some(entry_id) = state.jobs.remove(&task_id) {
            let _ = self.cron().remove(&entry_id).await;
            state.cron_exprs.remove(&task_id);
        }

        if let Some(timer) = state.one_offs.remove(&task_id) {
            timer.abort();
        }
    }

    async fn clear_schedules_locked(&self, state: &mut RwLockWriteGuard<'_, SchedState>) {
        let task_ids: Vec<i64> = state
            .jobs
            .keys()
            .chain(state.one_offs.keys())
            .copied()
            .collect();
        for task_id in task_ids {
            self.remove_task_locked(state, task_id).await;
        }
    }
}

/// One-shot firing: guarded by leadership and the enable flag, then the
/// task auto-disables so reconciles never refire it.
async fn fire_one_off(
    store: Arc<Store>,
    executor: Arc<Executor>,
    state: Arc<RwLock<SchedState>>,
    task_id: i64,
) {
    if !state.read().await.is_leader {
        return;
    }

    let task = match store.get_task(task_id) {
        Ok(task) => task,
        Err(err) => {
            warn!(task_id, "failed to load one-off task for firing: {err:#}");
            return;
        }
    };
    if !task.enabled {
        return;
    }

    let mut rx = executor.execute_async(task);
    if let Some(result) = rx.recv().await {
        if let Some(err) = result.error {
            warn!(task_id, "failed to execute one-off task: {err:#}");
        }
    }

    if let Err(err) = store.disable_one_off(task_id) {
        warn!(task_id, "failed to disable one-off task after execution: {err:#}");
    }
}
