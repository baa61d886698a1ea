use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::error::Result;
use crate::store::StateStore;

const EVENT_BUFFER: usize = 256;

struct Scalar {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    scalars: HashMap<String, Scalar>,
    lists: HashMap<String, Vec<Vec<u8>>>,
    sets: HashMap<String, BTreeSet<String>>,
}

#[derive(Clone)]
struct Event {
    channel: String,
    payload: Vec<u8>,
}

/// In-process [`StateStore`]. Leases are tracked per scalar and enforced
/// lazily on access, which is enough for lock semantics; pub/sub rides on
/// a broadcast channel.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Event>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    /// Drop the scalar if its lease has lapsed, then return it if present.
    fn live_scalar(&mut self, key: &str) -> Option<&Scalar> {
        let expired = match self.scalars.get(key) {
            Some(s) => s.expires_at.is_some_and(|at| at <= Instant::now()),
            None => return None,
        };
        if expired {
            self.scalars.remove(key);
            return None;
        }
        self.scalars.get(key)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock();
        Ok(inner.live_scalar(key).map(|s| s.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.lock();
        inner.scalars.insert(
            key.to_string(),
            Scalar {
                value: value.to_vec(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut inner = self.lock();
        if inner.live_scalar(key).is_some() {
            return Ok(false);
        }
        inner.scalars.insert(
            key.to_string(),
            Scalar {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.lock();
        if inner.live_scalar(key).is_none() {
            return Ok(false);
        }
        if let Some(scalar) = inner.scalars.get_mut(key) {
            scalar.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        Ok(inner.live_scalar(key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.scalars.remove(key);
        inner.lists.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut inner = self.lock();
        let matches = inner
            .live_scalar(key)
            .is_some_and(|s| s.value == expected);
        if matches {
            inner.scalars.remove(key);
        }
        Ok(matches)
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_vec());
        Ok(())
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>> {
        let inner = self.lock();
        let Some(list) = inner.lists.get(key) else {
            return Ok(None);
        };
        let len = list.len() as i64;
        let idx = if index < 0 { len + index } else { index };
        if idx < 0 || idx >= len {
            return Ok(None);
        }
        Ok(Some(list[idx as usize].clone()))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let inner = self.lock();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let from = if start < 0 { len + start } else { start }.max(0);
        let to = if stop < 0 { len + stop } else { stop }.min(len - 1);
        if len == 0 || from > to {
            return Ok(Vec::new());
        }
        Ok(list[from as usize..=to as usize].to_vec())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        // no subscribers is not an error
        let _ = self.events.send(Event {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) => {
                        if ev.channel == channel && tx.send(ev.payload).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }
}
