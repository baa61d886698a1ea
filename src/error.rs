use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronmeshError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Host group not found: {0}")]
    HostGroupNotFound(String),

    #[error("No valid host in host group {0}")]
    NoValidHost(String),

    #[error("No reachable worker in host group {0}")]
    NoConnHost(String),

    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("State store error: {0}")]
    Store(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Task run timed out after {0}s")]
    RunTimeout(u64),

    #[error("Task run canceled")]
    Canceled,

    #[error("{0}")]
    TaskFailed(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CronmeshError>;
