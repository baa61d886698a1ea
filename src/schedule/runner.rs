//! Execution graph runner: drives one fire of a master task through its
//! parent, master and child phases under the cluster run lock, collects
//! the run log and cleans the run's state-store artefacts.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::catalog::TaskDescriptor;
use crate::error::{CronmeshError, Result};
use crate::schedule::group::TaskGroup;
use crate::schedule::lock::RunLock;
use crate::schedule::model::{
    FirstFailure, RunLog, RunningTask, TaskPhase, TaskResult, TaskStatus, Trigger,
};
use crate::schedule::{Scheduler, TaskEntry};
use crate::store::keys;
use crate::worker::executor::DEFAULT_EXIT_CODE;

/// Per-fire state shared by every task invocation of the run.
pub(crate) struct RunContext {
    pub master_id: String,
    pub master_name: String,
    pub trigger: Trigger,
    pub start_millis: i64,
    /// first-writer-wins failure record, guarded for concurrent phases
    pub first_failure: Mutex<Option<FirstFailure>>,
    /// run-level token; cancelled by external kill
    pub cancel: CancellationToken,
}

impl Scheduler {
    /// One fire of a master task. Takes the run lock (dropping the fire
    /// on contention), registers the run in the cluster inventory, drives
    /// the three phases, then persists the log and releases everything.
    pub(crate) async fn start_run(self: Arc<Self>, entry: Arc<TaskEntry>, trigger: Trigger) {
        let lock = match RunLock::acquire(self.store.clone(), &entry.id, entry.lease_quarter).await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::warn!(task_id = %entry.id, name = %entry.name, "can not get run lock, fire dropped");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %entry.id, error = %e, "run lock acquire failed, fire dropped");
                return;
            }
        };
        tracing::info!(task_id = %entry.id, name = %entry.name, trigger = %trigger, "task run started");

        let cancel = CancellationToken::new();
        *entry.run_cancel.lock().await = Some(cancel.clone());

        let running = RunningTask {
            id: entry.id.clone(),
            name: entry.name.clone(),
            cron_expr: entry.cron_expr.clone(),
            start_millis: Utc::now().timestamp_millis(),
            trigger,
        };
        if let Err(e) = self.save_running_task(&running).await {
            tracing::error!(task_id = %entry.id, error = %e, "running-task inventory insert failed");
        }

        self.execute_run(&running, cancel).await;

        self.remove_running_task(&entry.id).await;
        lock.release().await;
        *entry.run_cancel.lock().await = None;
    }

    async fn execute_run(&self, running: &RunningTask, cancel: CancellationToken) {
        let desc = match self.fetch_task(&running.id).await {
            Ok(desc) => desc,
            Err(CronmeshError::TaskNotFound(_)) => {
                tracing::error!(task_id = %running.id, "task vanished from catalog, run aborted");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %running.id, error = %e, "descriptor fetch failed, run aborted");
                return;
            }
        };

        if let Err(e) = self.init_run_state(&desc).await {
            tracing::error!(task_id = %desc.id, error = %e, "run state init failed, run aborted");
            return;
        }

        let ctx = Arc::new(RunContext {
            master_id: desc.id.clone(),
            master_name: desc.name.clone(),
            trigger: running.trigger,
            start_millis: running.start_millis,
            first_failure: Mutex::new(None),
            cancel: cancel.clone(),
        });

        // The three phases share one slot, so they run in dependency
        // order; the first failing task anywhere cancels the rest.
        let mut phases = TaskGroup::new(&cancel, 1);
        {
            let scheduler = self.strong();
            let ctx = ctx.clone();
            let parents = desc.parents.clone();
            let parallel = desc.parent_parallel;
            phases
                .go(move |token| {
                    scheduler.run_phase(ctx, token, TaskPhase::Parent, parents, parallel)
                })
                .await;
        }
        {
            let scheduler = self.strong();
            let ctx = ctx.clone();
            let master = vec![desc.id.clone()];
            phases
                .go(move |token| scheduler.run_phase(ctx, token, TaskPhase::Master, master, false))
                .await;
        }
        {
            let scheduler = self.strong();
            let ctx = ctx.clone();
            let children = desc.children.clone();
            let parallel = desc.child_parallel;
            phases
                .go(move |token| {
                    scheduler.run_phase(ctx, token, TaskPhase::Child, children, parallel)
                })
                .await;
        }
        if let Err(e) = phases.wait().await {
            tracing::error!(task_id = %ctx.master_id, error = %e, "task run failed");
        }

        if let Err(e) = self.save_run_log(&ctx).await {
            tracing::error!(task_id = %ctx.master_id, error = %e, "run log persistence failed");
        }
    }

    /// Fan one phase out over its real tasks. Parallelism is the fan-out
    /// width when the phase's parallel flag is set, otherwise 1.
    pub(crate) async fn run_phase(
        self: Arc<Self>,
        ctx: Arc<RunContext>,
        parent: CancellationToken,
        phase: TaskPhase,
        task_ids: Vec<String>,
        parallel: bool,
    ) -> Result<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let width = if parallel { task_ids.len() } else { 1 };
        let mut group = TaskGroup::new(&parent, width);
        for task_id in task_ids {
            let scheduler = self.clone();
            let ctx = ctx.clone();
            group
                .go(move |token| scheduler.run_real_task(ctx, token, task_id, phase))
                .await;
        }
        group.wait().await
    }

    /// Rebuild the run's membership list and phase-key state, in the
    /// deterministic order parents, master, children.
    async fn init_run_state(&self, desc: &TaskDescriptor) -> Result<()> {
        self.store.delete(&keys::task_list(&desc.id)).await?;
        for parent_id in &desc.parents {
            self.init_phase_key(&desc.id, TaskPhase::Parent, parent_id)
                .await?;
        }
        self.init_phase_key(&desc.id, TaskPhase::Master, &desc.id)
            .await?;
        for child_id in &desc.children {
            self.init_phase_key(&desc.id, TaskPhase::Child, child_id)
                .await?;
        }
        Ok(())
    }

    async fn init_phase_key(&self, master_id: &str, phase: TaskPhase, real_id: &str) -> Result<()> {
        let member = keys::phase_key(master_id, phase.code(), real_id);
        self.store
            .rpush(&keys::task_list(master_id), member.as_bytes())
            .await?;
        self.store
            .set(
                &keys::phase_status(master_id, phase.code(), real_id),
                TaskStatus::Wait.code().to_string().as_bytes(),
                None,
            )
            .await?;
        self.store
            .delete(&keys::phase_log(master_id, phase.code(), real_id))
            .await?;
        Ok(())
    }

    /// Compose and persist the run log, then drop the run's store
    /// artefacts. Phase keys still waiting are reported as cancelled.
    async fn save_run_log(&self, ctx: &RunContext) -> Result<()> {
        let end_millis = Utc::now().timestamp_millis();
        let first_failure = ctx.first_failure.lock().await.clone();
        let failed = first_failure.is_some() || ctx.cancel.is_cancelled();

        let mut log = RunLog {
            name: ctx.master_name.clone(),
            master_task_id: ctx.master_id.clone(),
            start_millis: ctx.start_millis,
            end_millis,
            total_run_time_ms: end_millis - ctx.start_millis,
            trigger: ctx.trigger,
            status: if failed { -1 } else { 1 },
            err_task_id: String::new(),
            err_task_name: String::new(),
            err_code: 0,
            err_msg: String::new(),
            err_phase: None,
            task_results: Vec::new(),
        };
        if let Some(failure) = first_failure {
            log.err_task_id = failure.task_id;
            log.err_task_name = failure.task_name;
            log.err_code = failure.exit_code;
            log.err_msg = failure.message;
            log.err_phase = Some(failure.phase);
        }

        let members = self
            .store
            .lrange(&keys::task_list(&ctx.master_id), 0, -1)
            .await?;
        for member in members {
            let member = String::from_utf8_lossy(&member).to_string();
            let Some((master_id, phase_code, real_id)) = keys::parse_phase_key(&member) else {
                tracing::error!(key = %member, "malformed phase key in membership list");
                continue;
            };
            let Some(phase) = TaskPhase::from_code(phase_code) else {
                tracing::error!(key = %member, phase = phase_code, "unknown phase in membership list");
                continue;
            };

            let mut result = match self.read_result(&master_id, phase, &real_id).await {
                Some(result) => result,
                // a task that never started has no result record
                None => TaskResult {
                    task_id: real_id.clone(),
                    task_name: self
                        .entry(&real_id)
                        .await
                        .map(|e| e.name.clone())
                        .unwrap_or_default(),
                    run_host: String::new(),
                    exit_code: DEFAULT_EXIT_CODE,
                    phase,
                    status: String::new(),
                    log_data: String::new(),
                },
            };

            let status = self
                .read_status(&master_id, phase, &real_id)
                .await
                .unwrap_or(TaskStatus::Wait);
            result.status = if status == TaskStatus::Wait {
                TaskStatus::Cancel.to_string()
            } else {
                status.to_string()
            };

            let frames = self
                .store
                .lrange(&keys::phase_log(&master_id, phase.code(), &real_id), 0, -1)
                .await
                .unwrap_or_default();
            result.log_data = frames
                .iter()
                .map(|f| String::from_utf8_lossy(f))
                .collect::<Vec<_>>()
                .concat();

            log.task_results.push(result);
        }

        if let Err(e) = self.history.save(&log).await {
            tracing::error!(task_id = %ctx.master_id, error = %e, "run history save failed");
        }
        if let Err(e) = self.alarm.notify(&log).await {
            tracing::error!(task_id = %ctx.master_id, error = %e, "alarm dispatch failed");
        }

        self.clean_run_state(&ctx.master_id).await;
        Ok(())
    }

    /// Best-effort removal of every phase-key entry and the membership
    /// list itself.
    async fn clean_run_state(&self, master_id: &str) {
        let list_key = keys::task_list(master_id);
        let members = match self.store.lrange(&list_key, 0, -1).await {
            Ok(members) => members,
            Err(e) => {
                tracing::error!(task_id = %master_id, error = %e, "run state cleanup read failed");
                return;
            }
        };
        for member in members {
            let member = String::from_utf8_lossy(&member).to_string();
            let Some((master_id, phase, real_id)) = keys::parse_phase_key(&member) else {
                continue;
            };
            for key in [
                keys::phase_status(&master_id, phase, &real_id),
                keys::phase_resp(&master_id, phase, &real_id),
                keys::phase_log(&master_id, phase, &real_id),
            ] {
                if let Err(e) = self.store.delete(&key).await {
                    tracing::error!(key = %key, error = %e, "run state cleanup failed");
                }
            }
        }
        if let Err(e) = self.store.delete(&list_key).await {
            tracing::error!(key = %list_key, error = %e, "run state cleanup failed");
        }
    }

    pub(crate) async fn save_running_task(&self, running: &RunningTask) -> Result<()> {
        let payload = serde_json::to_vec(running)?;
        let member = keys::running_entry(&running.id);
        self.store.sadd(keys::RUNNING_SET, &member).await?;
        self.store.set(&member, &payload, None).await?;
        Ok(())
    }

    pub(crate) async fn remove_running_task(&self, task_id: &str) {
        let member = keys::running_entry(task_id);
        if let Err(e) = self.store.srem(keys::RUNNING_SET, &member).await {
            tracing::error!(task_id = %task_id, error = %e, "running-task set removal failed");
        }
        if let Err(e) = self.store.delete(&member).await {
            tracing::error!(task_id = %task_id, error = %e, "running-task entry removal failed");
        }
    }

    /// Write a phase-key status; failures are logged, the run surface is
    /// best-effort.
    pub(crate) async fn mark_status(
        &self,
        master_id: &str,
        phase: TaskPhase,
        real_id: &str,
        status: TaskStatus,
    ) {
        let key = keys::phase_status(master_id, phase.code(), real_id);
        if let Err(e) = self
            .store
            .set(&key, status.code().to_string().as_bytes(), None)
            .await
        {
            tracing::error!(key = %key, status = %status, error = %e, "status write failed");
        }
    }

    /// Append one raw output frame to a task's log list.
    pub(crate) async fn append_log(
        &self,
        master_id: &str,
        phase: TaskPhase,
        real_id: &str,
        frame: &[u8],
    ) {
        let key = keys::phase_log(master_id, phase.code(), real_id);
        if let Err(e) = self.store.rpush(&key, frame).await {
            tracing::error!(key = %key, error = %e, "log frame write failed");
        }
    }

    /// Append a timestamped controller-side log line.
    pub(crate) async fn append_log_line(
        &self,
        master_id: &str,
        phase: TaskPhase,
        real_id: &str,
        message: String,
    ) {
        let line = format!(
            "{}: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            message
        );
        self.append_log(master_id, phase, real_id, line.as_bytes())
            .await;
    }

    pub(crate) async fn store_result(
        &self,
        master_id: &str,
        phase: TaskPhase,
        real_id: &str,
        result: &TaskResult,
    ) {
        let key = keys::phase_resp(master_id, phase.code(), real_id);
        let payload = match serde_json::to_vec(result) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "result encode failed");
                return;
            }
        };
        if let Err(e) = self.store.set(&key, &payload, None).await {
            tracing::error!(key = %key, error = %e, "result write failed");
        }
    }

    pub(crate) async fn read_result(
        &self,
        master_id: &str,
        phase: TaskPhase,
        real_id: &str,
    ) -> Option<TaskResult> {
        let key = keys::phase_resp(master_id, phase.code(), real_id);
        let payload = self.store.get(&key).await.ok().flatten()?;
        match serde_json::from_slice(&payload) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(key = %key, error = %e, "result decode failed");
                None
            }
        }
    }
}
