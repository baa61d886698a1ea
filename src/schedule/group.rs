//! Cancellable task group with bounded parallelism.
//!
//! `go` blocks until a slot is free, so submission order is start order;
//! the first task error cancels the group token and tasks still waiting
//! for a slot never start. `wait` joins everything and yields the first
//! error.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{CronmeshError, Result};

pub struct TaskGroup {
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    first_err: Arc<Mutex<Option<CronmeshError>>>,
}

impl TaskGroup {
    pub fn new(parent: &CancellationToken, parallel: usize) -> Self {
        Self {
            cancel: parent.child_token(),
            permits: Arc::new(Semaphore::new(parallel.max(1))),
            tasks: JoinSet::new(),
            first_err: Arc::new(Mutex::new(None)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Submit a task. Blocks until a parallelism slot frees up; if the
    /// group is cancelled first, the task is silently dropped.
    pub async fn go<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            return;
        };

        let cancel = self.cancel.clone();
        let first_err = self.first_err.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = task(cancel.clone()).await {
                let mut slot = first_err.lock().await;
                if slot.is_none() {
                    *slot = Some(e);
                }
                drop(slot);
                cancel.cancel();
            }
        });
    }

    /// Join every submitted task; returns the first error observed.
    pub async fn wait(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    let mut slot = self.first_err.lock().await;
                    if slot.is_none() {
                        *slot = Some(CronmeshError::Internal(format!("group task panicked: {e}")));
                    }
                    drop(slot);
                    self.cancel.cancel();
                }
            }
        }
        match self.first_err.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
