//! Distributed document ownership lock.
//!
//! A backend owns document `D` while it holds
//! `matchmaker-lock:<D> = <addr>:<run id>`. The record carries a TTL, so a
//! crashed owner loses its documents once the TTL runs out. Refresh and
//! release only touch keys whose value is still ours.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

const KEY_PREFIX: &str = "matchmaker-lock:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed lock value: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Acquired,
    /// Someone else holds the lock; carries their value.
    HeldBy(String),
}

/// A key that refresh or release found not to be ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMismatch {
    pub key: String,
    /// Current value, `None` when the key expired or was deleted.
    pub holder: Option<String>,
}

pub fn lock_key(doc_id: Uuid) -> String {
    format!("{KEY_PREFIX}{doc_id}")
}

pub fn lock_value(addr: &str, run_id: Uuid) -> String {
    format!("{addr}:{run_id}")
}

/// Address part of a lock value. The run id never contains `:`, so the
/// split happens at the last one and the address may carry a port.
pub fn holder_addr(value: &str) -> Result<&str, LockError> {
    match value.rsplit_once(':') {
        Some((addr, run_id)) if !addr.is_empty() && !run_id.is_empty() => Ok(addr),
        _ => Err(LockError::Malformed(value.to_string())),
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` if it is free. Taking a key we already hold extends it.
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<LockStatus, LockError>;

    /// Extend every key still holding `value`. Returns the others.
    async fn refresh(&self, keys: &[String], value: &str, ttl: Duration) -> Result<Vec<LockMismatch>, LockError>;

    /// Delete every key still holding `value`. Returns the others.
    async fn release(&self, keys: &[String], value: &str) -> Result<Vec<LockMismatch>, LockError>;
}

// ─── In-memory store ────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    entries: HashMap<String, (String, Instant)>,
    unavailable: bool,
}

impl Inner {
    fn check(&self) -> Result<(), LockError> {
        if self.unavailable {
            return Err(LockError::Unavailable("lock store switched off".into()));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.as_str())
    }

    fn mismatch(&self, key: &str, value: &str) -> Option<LockMismatch> {
        match self.live(key) {
            Some(current) if current == value => None,
            holder => Some(LockMismatch {
                key: key.to_string(),
                holder: holder.map(str::to_string),
            }),
        }
    }
}

/// Lock store shared by every clone, with TTLs on the tokio clock.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with `LockError::Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Current unexpired value of `key`.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().await.live(key).map(str::to_string)
    }

    /// Overwrite `key` regardless of its holder.
    pub async fn force(&self, key: &str, value: &str, ttl: Duration) {
        self.inner
            .lock()
            .await
            .entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<LockStatus, LockError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        if let Some(current) = inner.live(key) {
            if current != value {
                return Ok(LockStatus::HeldBy(current.to_string()));
            }
        }
        inner
            .entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(LockStatus::Acquired)
    }

    async fn refresh(&self, keys: &[String], value: &str, ttl: Duration) -> Result<Vec<LockMismatch>, LockError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        let mut mismatches = Vec::new();
        for key in keys {
            match inner.mismatch(key, value) {
                Some(mismatch) => mismatches.push(mismatch),
                None => {
                    if let Some(entry) = inner.entries.get_mut(key) {
                        entry.1 = Instant::now() + ttl;
                    }
                }
            }
        }
        Ok(mismatches)
    }

    async fn release(&self, keys: &[String], value: &str) -> Result<Vec<LockMismatch>, LockError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        let mut mismatches = Vec::new();
        for key in keys {
            match inner.mismatch(key, value) {
                Some(mismatch) => mismatches.push(mismatch),
                None => {
                    inner.entries.remove(key);
                }
            }
        }
        Ok(mismatches)
    }
}
