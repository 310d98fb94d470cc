use super::backend::CacheBackend;
use crate::core::Result;
use crate::transaction::{Hook, TransactionContext};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, trace};

/// Cache writes that are undone when the surrounding transaction rolls back.
///
/// Each key written inside a transaction gets one `before_rollback` hook
/// that deletes it. Writing the same key again in the same transaction
/// replaces the hook, so the key is deleted once. Committed writes stay.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use txweave::cache::{CacheBackend, InMemoryCache, TransactionCache};
/// use txweave::{Outcome, TransactionContext, TransactionInterceptor, TxError};
///
/// # tokio_test::block_on(async {
/// let backend = Arc::new(InMemoryCache::default());
/// let cache = TransactionCache::new("users", backend.clone());
/// let ctx = TransactionContext::new();
///
/// let _: () = TransactionInterceptor::default()
///     .execute(&ctx, None, |ctx| async move {
///         cache.set(&ctx, "user:1", "alice").await?;
///         Ok::<_, TxError>(Outcome::RollbackSignal(()))
///     })
///     .await
///     .unwrap();
///
/// assert!(backend.get("user:1").await.unwrap().is_none());
/// # });
/// ```
#[derive(Clone)]
pub struct TransactionCache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl TransactionCache {
    pub fn new(name: impl Into<String>, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(key).await
    }

    /// Write through; deleted again if the current transaction rolls back.
    pub async fn set(&self, ctx: &TransactionContext, key: &str, value: &str) -> Result<()> {
        self.backend.set(key, value).await?;
        self.track(ctx, key);
        Ok(())
    }

    /// Add-if-absent. Only a successful add is undone on rollback; a key
    /// that already existed belongs to someone else.
    pub async fn add(&self, ctx: &TransactionContext, key: &str, value: &str) -> Result<bool> {
        let added = self.backend.add(key, value).await?;
        if added {
            self.track(ctx, key);
        }
        Ok(added)
    }

    /// Immediate delete; not affected by the transaction outcome.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    pub async fn set_json<T: Serialize>(
        &self,
        ctx: &TransactionContext,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.set(ctx, key, &encoded).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn track(&self, ctx: &TransactionContext, key: &str) {
        let hook_key = format!("cache:{}:{}", self.name, key);
        let backend = self.backend.clone();
        let cache_key = key.to_string();
        let name = self.name.clone();

        let hook = Hook::new().on_before_rollback(move || {
            let backend = backend.clone();
            let cache_key = cache_key.clone();
            let name = name.clone();
            async move {
                let removed = backend.delete(&cache_key).await?;
                debug!(cache = %name, key = %cache_key, removed, "cache write rolled back");
                Ok(())
            }
        });

        if !ctx.try_register_keyed_hook(hook_key, hook) {
            trace!(cache = %self.name, key, "no transaction; plain cache write");
        }
    }
}

impl std::fmt::Debug for TransactionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCache")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::transaction::TransactionDefinition;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts deletes on top of an in-memory cache
    #[derive(Default)]
    struct CountingBackend {
        inner: InMemoryCache,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for CountingBackend {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set(key, value).await
        }

        async fn add(&self, key: &str, value: &str) -> Result<bool> {
            self.inner.add(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_repeated_writes_delete_once() {
        let backend = Arc::new(CountingBackend::default());
        let cache = TransactionCache::new("c", backend.clone());
        let ctx = TransactionContext::new();

        let scope = ctx.get_transaction(&TransactionDefinition::required()).unwrap();
        cache.set(&ctx, "k", "1").await.unwrap();
        cache.set(&ctx, "k", "2").await.unwrap();
        cache.set(&ctx, "other", "x").await.unwrap();
        ctx.rollback(scope).await.unwrap();

        assert_eq!(backend.deletes.load(Ordering::SeqCst), 2);
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_add_is_not_undone() {
        let backend = Arc::new(InMemoryCache::default());
        backend.set("k", "theirs").await.unwrap();
        let cache = TransactionCache::new("c", backend.clone());
        let ctx = TransactionContext::new();

        let scope = ctx.get_transaction(&TransactionDefinition::required()).unwrap();
        assert!(!cache.add(&ctx, "k", "mine").await.unwrap());
        ctx.rollback(scope).await.unwrap();

        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("theirs"));
    }

    #[tokio::test]
    async fn test_commit_keeps_writes() {
        let backend = Arc::new(InMemoryCache::default());
        let cache = TransactionCache::new("c", backend.clone());
        let ctx = TransactionContext::new();

        let scope = ctx.get_transaction(&TransactionDefinition::required()).unwrap();
        cache.set_json(&ctx, "n", &vec![1, 2, 3]).await.unwrap();
        ctx.commit(scope).await.unwrap();

        let value: Option<Vec<i32>> = cache.get_json("n").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_write_without_transaction_is_plain() {
        let backend = Arc::new(InMemoryCache::default());
        let cache = TransactionCache::new("c", backend.clone());
        let ctx = TransactionContext::new();

        cache.set(&ctx, "k", "v").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
