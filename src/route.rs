//! Worker endpoint selection.
//!
//! A [`RouteChooser`] is created once per registered task and picks one
//! live endpoint out of the task's host group on every invocation. Host
//! group membership is re-read from the catalog per call, so hosts can
//! come and go between fires; a dial failure removes the candidate and
//! the policy picks again, bounded by the group size.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tonic::transport::{Channel, Endpoint};

use crate::catalog::{TaskSource, WorkerHost};
use crate::error::{CronmeshError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    #[default]
    Random,
    Weighted,
    LeastLoaded,
    RoundRobin,
}

impl FromStr for RoutePolicy {
    type Err = CronmeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(RoutePolicy::Random),
            "weighted" => Ok(RoutePolicy::Weighted),
            "least_loaded" => Ok(RoutePolicy::LeastLoaded),
            "round_robin" => Ok(RoutePolicy::RoundRobin),
            other => Err(CronmeshError::Internal(format!(
                "unknown route policy {other}"
            ))),
        }
    }
}

/// A dialled worker connection, owned by one invocation. Dropping it
/// releases the in-flight slot that feeds the least-loaded policy.
pub struct RouteConn {
    pub channel: Channel,
    pub target: String,
    _guard: InflightGuard,
}

struct InflightGuard {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    addr: String,
}

impl InflightGuard {
    fn enter(counts: Arc<Mutex<HashMap<String, usize>>>, addr: String) -> Self {
        {
            let mut counts = counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts.entry(addr.clone()).or_insert(0) += 1;
        }
        Self { counts, addr }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&self.addr) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.addr);
            }
        }
    }
}

pub struct RouteChooser {
    policy: RoutePolicy,
    host_group_id: String,
    source: Arc<dyn TaskSource>,
    cursor: AtomicUsize,
    inflight: Arc<Mutex<HashMap<String, usize>>>,
    dial_timeout: Duration,
}

impl RouteChooser {
    pub fn new(
        policy: RoutePolicy,
        host_group_id: String,
        source: Arc<dyn TaskSource>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            host_group_id,
            source,
            cursor: AtomicUsize::new(0),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            dial_timeout,
        }
    }

    /// Pick and dial one endpoint of the host group.
    pub async fn choose(&self) -> Result<RouteConn> {
        let hosts = self.source.host_group(&self.host_group_id).await?;
        if hosts.is_empty() {
            return Err(CronmeshError::NoValidHost(self.host_group_id.clone()));
        }

        let mut candidates = hosts;
        while !candidates.is_empty() {
            let idx = self.pick(&candidates);
            let host = candidates.remove(idx);
            match self.dial(&host.addr).await {
                Ok(channel) => {
                    let guard = InflightGuard::enter(self.inflight.clone(), host.addr.clone());
                    return Ok(RouteConn {
                        channel,
                        target: host.addr,
                        _guard: guard,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        addr = %host.addr,
                        host_group = %self.host_group_id,
                        error = %e,
                        "worker dial failed, trying next host"
                    );
                }
            }
        }
        Err(CronmeshError::NoConnHost(self.host_group_id.clone()))
    }

    fn pick(&self, candidates: &[WorkerHost]) -> usize {
        match self.policy {
            RoutePolicy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            RoutePolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            RoutePolicy::Weighted => {
                let total: u64 = candidates.iter().map(|h| u64::from(h.weight.max(1))).sum();
                let mut draw = rand::thread_rng().gen_range(0..total);
                for (i, host) in candidates.iter().enumerate() {
                    let weight = u64::from(host.weight.max(1));
                    if draw < weight {
                        return i;
                    }
                    draw -= weight;
                }
                candidates.len() - 1
            }
            RoutePolicy::LeastLoaded => {
                let counts = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, host)| counts.get(&host.addr).copied().unwrap_or(0))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            }
        }
    }

    async fn dial(&self, addr: &str) -> Result<Channel> {
        let endpoint =
            Endpoint::from_shared(format!("http://{addr}"))?.connect_timeout(self.dial_timeout);
        Ok(endpoint.connect().await?)
    }
}
