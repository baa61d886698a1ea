//! Shared state store: the cluster-visible substrate for run locks, run
//! status, per-run logs and the running-task inventory.
//!
//! The scheduler only depends on the primitives below; any store offering
//! them (the in-process [`MemoryStore`], or a networked key-value store
//! with the same semantics) can back a cluster. The key schema in [`keys`]
//! is stable on the wire.

pub mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a scalar, optionally with a time-to-live.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Atomic set-if-absent with a lease. Returns true when the key was set.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Refresh the lease of an existing key. Returns false if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete the key only if its current value equals `expected`.
    /// Returns true when the key was deleted.
    async fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Append to the tail of a list.
    async fn rpush(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read one list element; negative indices count from the tail (-1 = last).
    async fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>>;

    /// Read an inclusive list range; negative indices count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to a channel; the receiver yields raw payloads until the
    /// store shuts down.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>>;
}

/// Key schema shared by every control-plane node on a cluster.
pub mod keys {
    /// Set of `task:running:<id>` member keys.
    pub const RUNNING_SET: &str = "task:running";

    /// Pub/sub channel carrying schedule-mutation events.
    pub const EVENT_CHANNEL: &str = "task:event";

    pub fn run_lock(task_id: &str) -> String {
        format!("task:runlock:{task_id}")
    }

    /// Membership list enumerating every phase key of the active run.
    pub fn task_list(master_id: &str) -> String {
        format!("task:{master_id}")
    }

    pub fn phase_key(master_id: &str, phase: i32, real_id: &str) -> String {
        format!("task:{master_id}:{phase}:{real_id}")
    }

    pub fn phase_status(master_id: &str, phase: i32, real_id: &str) -> String {
        format!("task:{master_id}:{phase}:{real_id}:status")
    }

    pub fn phase_resp(master_id: &str, phase: i32, real_id: &str) -> String {
        format!("task:{master_id}:{phase}:{real_id}:resp")
    }

    pub fn phase_log(master_id: &str, phase: i32, real_id: &str) -> String {
        format!("task:{master_id}:{phase}:{real_id}:reallog")
    }

    pub fn running_entry(task_id: &str) -> String {
        format!("{RUNNING_SET}:{task_id}")
    }

    /// Parse `task:<master>:<phase>:<real>` back into its parts.
    pub fn parse_phase_key(key: &str) -> Option<(String, i32, String)> {
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() != 4 || parts[0] != "task" {
            return None;
        }
        let phase = parts[2].parse::<i32>().ok()?;
        Some((parts[1].to_string(), phase, parts[3].to_string()))
    }
}
