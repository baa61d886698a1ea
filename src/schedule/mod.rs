//! The schedule control plane.
//!
//! [`Scheduler`] is the in-process registry: one [`TaskEntry`] (and one
//! timer task) per registered task id, rebuilt from the catalog at boot
//! and mutated by schedule events. Cross-process concerns (the run lock,
//! run status, the running-task inventory) live in the state store; the
//! registry is only authoritative for local timers.

pub mod events;
pub mod group;
pub mod invoker;
pub mod lock;
pub mod model;
pub mod runner;
pub mod surface;
pub mod timer;

pub use lock::RunLock;
pub use model::{
    FirstFailure, LogChunk, RunLog, RunningTask, TaskPhase, TaskResult, TaskStatus,
    TaskStatusTree, Trigger,
};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::catalog::{AlarmSink, RunHistory, TaskDescriptor, TaskSource};
use crate::config::SchedulerConfig;
use crate::error::{CronmeshError, Result};
use crate::route::RouteChooser;
use crate::store::{keys, StateStore};

/// Registry entry: the descriptor snapshot a timer needs, plus the
/// handles to stop it and to abort its in-flight run.
pub struct TaskEntry {
    pub id: String,
    pub name: String,
    pub cron_expr: String,
    pub enabled: bool,
    pub chooser: Arc<RouteChooser>,
    /// lock lease renewal interval, derived from the cron interval
    pub lease_quarter: Duration,
    pub(crate) close: CancellationToken,
    pub(crate) run_cancel: Mutex<Option<CancellationToken>>,
}

pub struct Scheduler {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) source: Arc<dyn TaskSource>,
    pub(crate) history: Arc<dyn RunHistory>,
    pub(crate) alarm: Arc<dyn AlarmSink>,
    pub(crate) config: SchedulerConfig,
    entries: RwLock<HashMap<String, Arc<TaskEntry>>>,
    /// self-handle for spawning timers and runs from `&self` methods
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        source: Arc<dyn TaskSource>,
        history: Arc<dyn RunHistory>,
        alarm: Arc<dyn AlarmSink>,
    ) -> Arc<Self> {
        Self::with_config(store, source, history, alarm, SchedulerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn StateStore>,
        source: Arc<dyn TaskSource>,
        history: Arc<dyn RunHistory>,
        alarm: Arc<dyn AlarmSink>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            source,
            history,
            alarm,
            config,
            entries: RwLock::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("scheduler dropped")
    }

    /// Load every catalog task into the registry and subscribe to peer
    /// schedule events. A no-op until the catalog reports installed.
    pub async fn boot(&self) -> Result<()> {
        if !self.source.is_installed().await? {
            tracing::debug!("catalog not installed yet, schedule boot skipped");
            return Ok(());
        }

        let tasks = self.source.tasks().await?;
        for task in &tasks {
            self.add_task(task.clone()).await;
        }

        let events = self.store.subscribe(keys::EVENT_CHANNEL).await?;
        let scheduler = self.strong();
        tokio::spawn(scheduler.event_loop(events));

        tracing::info!(total = tasks.len(), "task schedule initialised");
        Ok(())
    }

    /// Register a task, replacing any previous registration. The old
    /// timer always stops; the old in-flight run is aborted only when the
    /// cron expression or enabled flag changed, otherwise it completes
    /// under its own lock.
    pub async fn add_task(&self, desc: TaskDescriptor) {
        tracing::debug!(task_id = %desc.id, name = %desc.name, "registering task");

        let old = self.entries.write().await.remove(&desc.id);
        let inherited_cancel = match &old {
            Some(old) => {
                old.close.cancel();
                let active = old.run_cancel.lock().await.take();
                if old.cron_expr == desc.cron_expr && old.enabled == desc.enabled {
                    active
                } else {
                    if let Some(cancel) = active {
                        cancel.cancel();
                    }
                    None
                }
            }
            None => None,
        };

        let chooser = Arc::new(RouteChooser::new(
            desc.route_policy,
            desc.host_group_id.clone(),
            self.source.clone(),
            self.config.dial_timeout,
        ));
        let entry = Arc::new(TaskEntry {
            id: desc.id.clone(),
            name: desc.name.clone(),
            cron_expr: desc.cron_expr.clone(),
            enabled: desc.enabled,
            chooser,
            lease_quarter: timer::lease_quarter(&desc.cron_expr),
            close: CancellationToken::new(),
            run_cancel: Mutex::new(inherited_cancel),
        });

        self.entries
            .write()
            .await
            .insert(desc.id.clone(), entry.clone());

        tokio::spawn(timer::schedule_loop(self.strong(), entry));
    }

    /// Remove a task: stop its timer and abort its in-flight run. A
    /// racing fire either sees the entry gone and no-ops, or is cancelled.
    pub async fn delete_task(&self, task_id: &str) {
        let removed = self.entries.write().await.remove(task_id);
        let Some(entry) = removed else {
            return;
        };
        entry.close.cancel();
        if let Some(cancel) = entry.run_cancel.lock().await.take() {
            cancel.cancel();
        }
        tracing::info!(task_id = %task_id, name = %entry.name, "task removed from schedule");
    }

    /// Abort the in-flight run, if any, without touching the timer.
    pub async fn kill_task(&self, task_id: &str) {
        let Some(entry) = self.entry(task_id).await else {
            tracing::warn!(task_id = %task_id, "kill ignored, task not registered");
            return;
        };
        let guard = entry.run_cancel.lock().await;
        if let Some(cancel) = guard.as_ref() {
            tracing::info!(task_id = %task_id, name = %entry.name, "killing running task");
            cancel.cancel();
        }
    }

    /// Fire a run outside the cron timeline; the run-lock discipline is
    /// the same as for timed fires.
    pub async fn run_task(&self, task_id: &str, trigger: Trigger) -> Result<()> {
        let entry = self
            .entry(task_id)
            .await
            .ok_or_else(|| CronmeshError::TaskNotFound(task_id.to_string()))?;
        let scheduler = self.strong();
        tokio::spawn(async move {
            scheduler.start_run(entry, trigger).await;
        });
        Ok(())
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.entries.read().await.contains_key(task_id)
    }

    /// Whether the run lock for this task currently exists in the store.
    pub async fn is_running(&self, task_id: &str) -> Result<bool> {
        if !self.contains(task_id).await {
            return Err(CronmeshError::TaskNotFound(task_id.to_string()));
        }
        RunLock::is_locked(&self.store, task_id).await
    }

    pub(crate) async fn entry(&self, task_id: &str) -> Option<Arc<TaskEntry>> {
        self.entries.read().await.get(task_id).cloned()
    }

    /// Catalog lookup bounded by the configured query budget.
    pub(crate) async fn fetch_task(&self, task_id: &str) -> Result<TaskDescriptor> {
        match tokio::time::timeout(self.config.max_query_time, self.source.task(task_id)).await {
            Ok(res) => res,
            Err(_) => Err(CronmeshError::Internal(format!(
                "catalog lookup for task {task_id} timed out"
            ))),
        }
    }
}
