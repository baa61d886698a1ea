//! Cluster-wide run lock: a lease-bounded set-if-absent key plus a
//! background renewer. Release is keyed by a per-acquisition nonce, so a
//! stale holder can never delete a successor's lock.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{keys, StateStore};

pub struct RunLock {
    store: Arc<dyn StateStore>,
    key: String,
    nonce: String,
    stop_renew: CancellationToken,
}

impl RunLock {
    /// Try to take the run lock for `task_id` with the given lease.
    /// Returns `None` when another holder owns it; the fire is dropped,
    /// never queued. On success a renewer refreshes the lease at 3/4
    /// intervals until release.
    pub async fn acquire(
        store: Arc<dyn StateStore>,
        task_id: &str,
        lease: Duration,
    ) -> Result<Option<RunLock>> {
        let key = keys::run_lock(task_id);
        let nonce = Uuid::new_v4().to_string();
        if !store.set_nx(&key, nonce.as_bytes(), lease).await? {
            return Ok(None);
        }

        let stop_renew = CancellationToken::new();
        tokio::spawn(renew_loop(
            store.clone(),
            key.clone(),
            lease,
            stop_renew.clone(),
        ));

        Ok(Some(RunLock {
            store,
            key,
            nonce,
            stop_renew,
        }))
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Stop renewal and delete the lock if we still own it. A no-op when
    /// the stored value is no longer our nonce.
    pub async fn release(&self) {
        self.stop_renew.cancel();
        match self
            .store
            .delete_if_equal(&self.key, self.nonce.as_bytes())
            .await
        {
            Ok(true) => tracing::debug!(key = %self.key, "run lock released"),
            Ok(false) => tracing::warn!(key = %self.key, "run lock already lost at release"),
            Err(e) => tracing::error!(key = %self.key, error = %e, "run lock release failed"),
        }
    }

    pub async fn is_locked(store: &Arc<dyn StateStore>, task_id: &str) -> Result<bool> {
        store.exists(&keys::run_lock(task_id)).await
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.stop_renew.cancel();
    }
}

async fn renew_loop(
    store: Arc<dyn StateStore>,
    key: String,
    lease: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(lease * 3 / 4);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::debug!(key = %key, "lock renewal stopped");
                return;
            }
            _ = ticker.tick() => {
                match store.expire(&key, lease).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(key = %key, "run lock vanished during renewal"),
                    Err(e) => tracing::error!(key = %key, error = %e, "run lock renewal failed"),
                }
            }
        }
    }
}
