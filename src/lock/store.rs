use crate::core::{Result, TxError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// CAS-capable key/value store that arbitrates lock ownership.
///
/// Every failure to reach the backend is `TxError::LockUnavailable`;
/// a conditional operation that does not match returns `Ok(false)`.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `value` with `ttl` only if the key is absent (or expired).
    async fn add_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the TTL of `key` only if its current value equals `expected`.
    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically add `delta` to an integer counter, creating it at 0 with `ttl`.
    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64>;
}

#[derive(Debug, Clone)]
struct StoreEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Process-local `LockStore` with TTLs on the tokio clock.
///
/// Useful for tests and single-process deployments. It can simulate an
/// outage (`set_available(false)`) and forced lease expiry.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, StoreEntry>>,
    unavailable: AtomicBool,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated backend reachability
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Drop `key` as if its TTL had elapsed
    pub async fn force_expire(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TxError::LockUnavailable(
                "in-memory lock store is offline".into(),
            ));
        }
        Ok(())
    }
}

fn live_entry<'a>(
    entries: &'a mut HashMap<String, StoreEntry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut StoreEntry> {
    let expired = entries.get(key).map(|e| !e.is_live(now)).unwrap_or(false);
    if expired {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn add_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            StoreEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let matches = live_entry(&mut entries, key, now)
            .map(|entry| entry.value == expected)
            .unwrap_or(false);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(live_entry(&mut entries, key, now).map(|entry| entry.value.clone()))
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live_entry(&mut entries, key, now) {
            let current: i64 = entry.value.parse().map_err(|_| {
                TxError::IllegalState(format!("key '{}' does not hold a counter", key))
            })?;
            let next = current + delta;
            entry.value = next.to_string();
            return Ok(next);
        }
        entries.insert(
            key.to_string(),
            StoreEntry {
                value: delta.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(delta)
    }
}
