use crate::core::{Result, TxError};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Key/value cache the transaction-aware layer writes through to.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Store only if the key is absent; returns whether the value was stored.
    async fn add(&self, key: &str, value: &str) -> Result<bool>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

struct CachedValue {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Bounded LRU cache with an optional TTL applied to every write.
pub struct InMemoryCache {
    entries: Mutex<LruCache<String, CachedValue>>,
    ttl: Option<Duration>,
    unavailable: AtomicBool,
}

impl InMemoryCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: None,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Capacity used by `Default`
    pub const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
        Some(n) => n,
        None => NonZeroUsize::MIN,
    };

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, v)| v.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TxError::Cache("in-memory cache is offline".into()));
        }
        Ok(())
    }

    fn entry(&self, value: &str, now: Instant) -> CachedValue {
        CachedValue {
            value: value.to_string(),
            expires_at: self.ttl.map(|ttl| now + ttl),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

fn evict_if_expired(entries: &mut LruCache<String, CachedValue>, key: &str, now: Instant) {
    let expired = entries.peek(key).map(|v| !v.is_live(now)).unwrap_or(false);
    if expired {
        entries.pop(key);
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        evict_if_expired(&mut entries, key, now);
        Ok(entries.get(key).map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let now = Instant::now();
        let entry = self.entry(value, now);
        self.entries.lock().await.put(key.to_string(), entry);
        Ok(())
    }

    async fn add(&self, key: &str, value: &str) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        evict_if_expired(&mut entries, key, now);
        if entries.contains(key) {
            return Ok(false);
        }
        entries.put(key.to_string(), self.entry(value, now));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.entries.lock().await.pop(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_does_not_overwrite() {
        let cache = InMemoryCache::default();
        assert!(cache.add("k", "1").await.unwrap());
        assert!(!cache.add("k", "2").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_lru_evicts_oldest() {
        let cache = InMemoryCache::new(NonZeroUsize::new(2).unwrap());
        cache.set("a", "1").await.unwrap();
        cache.set("b", "2").await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", "3").await.unwrap();

        assert!(cache.get("b").await.unwrap().is_none());
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_entries() {
        let cache = InMemoryCache::default().with_ttl(Duration::from_secs(1));
        cache.set("k", "v").await.unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.add("k", "again").await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_cache_errors() {
        let cache = InMemoryCache::default();
        cache.set_available(false);
        assert!(matches!(cache.set("k", "v").await, Err(TxError::Cache(_))));
    }
}
