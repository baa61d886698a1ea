use serde::{Deserialize, Serialize};

/// Per-phase-key run status, stored as a decimal integer in the state
/// store. Transitions are monotonic: Wait -> Run -> {Finish, Fail, Cancel}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Wait,
    Run,
    Finish,
    Fail,
    Cancel,
}

impl TaskStatus {
    pub fn code(self) -> i64 {
        match self {
            TaskStatus::Wait => 0,
            TaskStatus::Run => 1,
            TaskStatus::Finish => 2,
            TaskStatus::Fail => 3,
            TaskStatus::Cancel => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Wait),
            1 => Some(TaskStatus::Run),
            2 => Some(TaskStatus::Finish),
            3 => Some(TaskStatus::Fail),
            4 => Some(TaskStatus::Cancel),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finish | TaskStatus::Fail | TaskStatus::Cancel
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Wait => write!(f, "wait"),
            TaskStatus::Run => write!(f, "run"),
            TaskStatus::Finish => write!(f, "finish"),
            TaskStatus::Fail => write!(f, "fail"),
            TaskStatus::Cancel => write!(f, "cancel"),
        }
    }
}

/// Which role a real task plays inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Parent,
    Master,
    Child,
}

impl TaskPhase {
    pub fn code(self) -> i32 {
        match self {
            TaskPhase::Parent => 1,
            TaskPhase::Master => 2,
            TaskPhase::Child => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(TaskPhase::Parent),
            2 => Some(TaskPhase::Master),
            3 => Some(TaskPhase::Child),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Parent => write!(f, "parent"),
            TaskPhase::Master => write!(f, "master"),
            TaskPhase::Child => write!(f, "child"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Auto,
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Auto => write!(f, "auto"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

/// Result record of one real-task invocation, stored under the phase
/// key's `resp` entry and echoed into the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub task_name: String,
    /// the dialled worker endpoint, empty when no dial succeeded
    pub run_host: String,
    pub exit_code: i32,
    pub phase: TaskPhase,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub log_data: String,
}

/// The earliest failing task of a run; written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstFailure {
    pub phase: TaskPhase,
    pub task_id: String,
    pub task_name: String,
    pub exit_code: i32,
    pub message: String,
}

/// Durable record of one finished run, handed to the history collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub name: String,
    pub master_task_id: String,
    pub start_millis: i64,
    pub end_millis: i64,
    pub total_run_time_ms: i64,
    pub trigger: Trigger,
    /// 1 = success, -1 = failed or killed
    pub status: i32,
    #[serde(default)]
    pub err_task_id: String,
    #[serde(default)]
    pub err_task_name: String,
    #[serde(default)]
    pub err_code: i32,
    #[serde(default)]
    pub err_msg: String,
    #[serde(default)]
    pub err_phase: Option<TaskPhase>,
    pub task_results: Vec<TaskResult>,
}

/// Cluster-visible inventory entry for an in-flight run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTask {
    pub id: String,
    pub name: String,
    pub cron_expr: String,
    pub start_millis: i64,
    pub trigger: Trigger,
}

/// One node of the live status tree: three group nodes (parents, master,
/// children) with per-task leaves under the parent and child groups.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusTree {
    pub id: String,
    pub name: String,
    pub phase: TaskPhase,
    pub status: String,
    pub children: Vec<TaskStatusTree>,
}

/// One poll of a task's live log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    /// the frame at the requested offset
    Frame(Vec<u8>),
    /// no frame and the task reached a terminal status
    Eof,
    /// no frame yet, poll again
    Pending,
}
