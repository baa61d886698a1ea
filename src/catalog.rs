//! Task descriptors and the read-only collaborators the scheduler talks to:
//! the descriptor catalog, the run-history sink, and the alarm sink.
//!
//! The scheduler never owns task definitions; it snapshots them per run
//! through [`TaskSource`]. The in-memory implementations back tests and
//! single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{CronmeshError, Result};
use crate::route::RoutePolicy;
use crate::schedule::model::RunLog;

/// How the worker interprets a task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Shell,
    Api,
}

impl TaskKind {
    pub fn code(self) -> i32 {
        match self {
            TaskKind::Shell => 1,
            TaskKind::Api => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(TaskKind::Shell),
            2 => Some(TaskKind::Api),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Shell => write!(f, "shell"),
            TaskKind::Api => write!(f, "api"),
        }
    }
}

/// One worker endpoint inside a host group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHost {
    /// host:port of the worker gRPC service
    pub addr: String,
    /// relative weight for the weighted route policy
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    100
}

/// Immutable task definition, fetched from the catalog once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    pub name: String,
    pub cron_expr: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub parent_parallel: bool,
    #[serde(default)]
    pub child_parallel: bool,
    pub host_group_id: String,
    #[serde(default)]
    pub route_policy: RoutePolicy,
    pub kind: TaskKind,
    /// opaque bytes handed to the worker, interpreted per `kind`
    #[serde(default)]
    pub payload: Vec<u8>,
    /// 0 means no per-task deadline
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub expect_code: i32,
    /// empty means no output check
    #[serde(default)]
    pub expect_content: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Read-only descriptor catalog.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn task(&self, id: &str) -> Result<TaskDescriptor>;

    /// Enumerate every descriptor, for schedule boot.
    async fn tasks(&self) -> Result<Vec<TaskDescriptor>>;

    async fn host_group(&self, id: &str) -> Result<Vec<WorkerHost>>;

    /// Out-of-band install flag; the schedule does not boot until this
    /// reports true.
    async fn is_installed(&self) -> Result<bool>;
}

/// Durable run-history sink (relational catalog in production).
#[async_trait]
pub trait RunHistory: Send + Sync {
    async fn save(&self, log: &RunLog) -> Result<()>;
}

/// Alarm dispatch collaborator, invoked with every finished run log.
#[async_trait]
pub trait AlarmSink: Send + Sync {
    async fn notify(&self, log: &RunLog) -> Result<()>;
}

/// In-memory catalog used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCatalog {
    tasks: RwLock<HashMap<String, TaskDescriptor>>,
    host_groups: RwLock<HashMap<String, Vec<WorkerHost>>>,
    installed: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_task(&self, desc: TaskDescriptor) {
        self.tasks.write().await.insert(desc.id.clone(), desc);
    }

    pub async fn remove_task(&self, id: &str) {
        self.tasks.write().await.remove(id);
    }

    pub async fn insert_host_group(&self, id: &str, hosts: Vec<WorkerHost>) {
        self.host_groups.write().await.insert(id.to_string(), hosts);
    }

    pub fn set_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskSource for MemoryCatalog {
    async fn task(&self, id: &str) -> Result<TaskDescriptor> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CronmeshError::TaskNotFound(id.to_string()))
    }

    async fn tasks(&self) -> Result<Vec<TaskDescriptor>> {
        let mut all: Vec<TaskDescriptor> = self.tasks.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn host_group(&self, id: &str) -> Result<Vec<WorkerHost>> {
        self.host_groups
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CronmeshError::HostGroupNotFound(id.to_string()))
    }

    async fn is_installed(&self) -> Result<bool> {
        Ok(self.installed.load(Ordering::SeqCst))
    }
}

/// Run-history sink that keeps logs in memory, newest last.
#[derive(Default)]
pub struct MemoryHistory {
    logs: Mutex<Vec<RunLog>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn logs(&self) -> Vec<RunLog> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl RunHistory for MemoryHistory {
    async fn save(&self, log: &RunLog) -> Result<()> {
        self.logs.lock().await.push(log.clone());
        Ok(())
    }
}

/// Alarm sink that only logs failed runs.
pub struct LogAlarm;

#[async_trait]
impl AlarmSink for LogAlarm {
    async fn notify(&self, log: &RunLog) -> Result<()> {
        if log.status < 0 {
            tracing::warn!(
                task_id = %log.master_task_id,
                name = %log.name,
                err_task = %log.err_task_id,
                err_msg = %log.err_msg,
                "task run failed"
            );
        }
        Ok(())
    }
}
