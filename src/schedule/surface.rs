//! Query side of the run surface: the live status tree, log tailing and
//! the cluster running-task inventory.

use crate::error::{CronmeshError, Result};
use crate::schedule::lock::RunLock;
use crate::schedule::model::{LogChunk, RunningTask, TaskPhase, TaskStatus, TaskStatusTree};
use crate::schedule::Scheduler;
use crate::store::keys;

impl Scheduler {
    /// Status of every phase key of the active (or last initialised) run
    /// of `master_id`, grouped as [parents, master, children]. The group
    /// status surfaces a cancelled, running or failed member over the
    /// rest. `finished` is true once no member waits or runs.
    pub async fn task_tree_status(
        &self,
        master_id: &str,
    ) -> Result<(Vec<TaskStatusTree>, bool)> {
        let members = self
            .store
            .lrange(&keys::task_list(master_id), 0, -1)
            .await?;
        if members.is_empty() {
            return Err(CronmeshError::Store(format!(
                "no run state for task {master_id}"
            )));
        }

        let mut groups = vec![
            group_node(TaskPhase::Parent),
            group_node(TaskPhase::Master),
            group_node(TaskPhase::Child),
        ];
        let mut finished = true;
        let mut parent_locked = false;
        let mut child_locked = false;

        for member in members {
            let member = String::from_utf8_lossy(&member).to_string();
            let Some((_, phase_code, real_id)) = keys::parse_phase_key(&member) else {
                tracing::error!(key = %member, "malformed phase key in membership list");
                continue;
            };
            let Some(phase) = TaskPhase::from_code(phase_code) else {
                continue;
            };
            let Some(status) = self.read_status(master_id, phase, &real_id).await else {
                tracing::error!(key = %member, "phase status missing");
                continue;
            };
            if matches!(status, TaskStatus::Wait | TaskStatus::Run) {
                finished = false;
            }

            let node = TaskStatusTree {
                id: real_id.clone(),
                name: self
                    .entry(&real_id)
                    .await
                    .map(|e| e.name.clone())
                    .unwrap_or_default(),
                phase,
                status: status.to_string(),
                children: Vec::new(),
            };
            match phase {
                TaskPhase::Parent => {
                    aggregate(&mut groups[0], status, &mut parent_locked);
                    groups[0].children.push(node);
                }
                TaskPhase::Master => {
                    groups[1].id = node.id.clone();
                    groups[1].name = node.name.clone();
                    groups[1].status = node.status.clone();
                }
                TaskPhase::Child => {
                    aggregate(&mut groups[2], status, &mut child_locked);
                    groups[2].children.push(node);
                }
            }
        }
        Ok((groups, finished))
    }

    /// Poll one frame of a task's live log at `offset`. Yields `Eof` once
    /// the frame is absent and the task reached a terminal status, and
    /// `Pending` while the task still runs.
    pub async fn task_real_log(
        &self,
        master_id: &str,
        phase: TaskPhase,
        real_id: &str,
        offset: i64,
    ) -> Result<LogChunk> {
        let frame = self
            .store
            .lindex(&keys::phase_log(master_id, phase.code(), real_id), offset)
            .await?;
        if let Some(frame) = frame {
            return Ok(LogChunk::Frame(frame));
        }
        match self.read_status(master_id, phase, real_id).await {
            Some(status) if status.is_terminal() => Ok(LogChunk::Eof),
            Some(_) => Ok(LogChunk::Pending),
            None => Err(CronmeshError::Store(format!(
                "no status for task {real_id} of run {master_id}"
            ))),
        }
    }

    /// Cluster-wide running-task inventory, sorted by start time. Each
    /// candidate is verified against its run lock; entries whose task id
    /// the registry no longer knows are orphans from a crashed controller
    /// and are removed on sight.
    pub async fn running_tasks(&self) -> Result<Vec<RunningTask>> {
        let members = self.store.smembers(keys::RUNNING_SET).await?;
        let mut running = Vec::new();
        for member in members {
            let payload = match self.store.get(&member).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(key = %member, error = %e, "inventory entry read failed");
                    continue;
                }
            };
            let task: RunningTask = match serde_json::from_slice(&payload) {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!(key = %member, error = %e, "inventory entry decode failed");
                    continue;
                }
            };

            if !self.contains(&task.id).await {
                tracing::warn!(task_id = %task.id, "removing orphaned running-task entry");
                self.remove_running_task(&task.id).await;
                continue;
            }
            match RunLock::is_locked(&self.store, &task.id).await {
                Ok(true) => running.push(task),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "run lock check failed");
                }
            }
        }
        running.sort_by_key(|task| task.start_millis);
        Ok(running)
    }

    pub(crate) async fn read_status(
        &self,
        master_id: &str,
        phase: TaskPhase,
        real_id: &str,
    ) -> Option<TaskStatus> {
        let raw = self
            .store
            .get(&keys::phase_status(master_id, phase.code(), real_id))
            .await
            .ok()
            .flatten()?;
        std::str::from_utf8(&raw)
            .ok()?
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(TaskStatus::from_code)
    }
}

fn group_node(phase: TaskPhase) -> TaskStatusTree {
    TaskStatusTree {
        id: String::new(),
        name: String::new(),
        phase,
        status: TaskStatus::Wait.to_string(),
        children: Vec::new(),
    }
}

/// Group status takes the first cancelled/running/failed member and
/// sticks with it; otherwise it tracks the last member seen.
fn aggregate(group: &mut TaskStatusTree, status: TaskStatus, locked: &mut bool) {
    if *locked {
        return;
    }
    group.status = status.to_string();
    if matches!(
        status,
        TaskStatus::Cancel | TaskStatus::Run | TaskStatus::Fail
    ) {
        *locked = true;
    }
}
