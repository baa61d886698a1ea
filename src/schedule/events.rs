//! Schedule-mutation event bus. One pub/sub channel carries add, delete
//! and kill events between control-plane peers; each node subscribes once
//! at boot and applies events to its local registry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::catalog::TaskDescriptor;
use crate::schedule::Scheduler;
use crate::store::keys;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskEvent {
    Add {
        task_id: String,
        /// carried when the publisher has the descriptor at hand;
        /// subscribers fall back to the catalog otherwise
        #[serde(default)]
        descriptor: Option<TaskDescriptor>,
    },
    Delete {
        task_id: String,
    },
    Kill {
        task_id: String,
    },
}

impl Scheduler {
    /// Best-effort fan-out of a schedule mutation to peers. Peers resync
    /// from the catalog on reconnect, so a lost event is not fatal.
    pub async fn publish_event(&self, event: &TaskEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "schedule event encode failed");
                return;
            }
        };
        if let Err(e) = self.store.publish(keys::EVENT_CHANNEL, &payload).await {
            tracing::error!(error = %e, "schedule event publish failed");
        }
    }

    pub(crate) async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<Vec<u8>>) {
        while let Some(payload) = events.recv().await {
            let event: TaskEvent = match serde_json::from_slice(&payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(error = %e, "malformed schedule event");
                    continue;
                }
            };
            self.apply_event(event).await;
        }
        tracing::warn!("schedule event subscription closed");
    }

    /// Apply one event to the local registry. Safe to replay: add is a
    /// replace, delete and kill tolerate absent tasks.
    pub async fn apply_event(&self, event: TaskEvent) {
        match event {
            TaskEvent::Add {
                task_id,
                descriptor,
            } => {
                let desc = match descriptor {
                    Some(desc) => Ok(desc),
                    None => self.fetch_task(&task_id).await,
                };
                match desc {
                    Ok(desc) => self.add_task(desc).await,
                    Err(e) => {
                        tracing::error!(task_id = %task_id, error = %e, "add event for unknown task")
                    }
                }
            }
            TaskEvent::Delete { task_id } => self.delete_task(&task_id).await,
            TaskEvent::Kill { task_id } => self.kill_task(&task_id).await,
        }
    }
}
