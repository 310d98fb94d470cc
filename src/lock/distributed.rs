use super::store::LockStore;
use crate::config::TxConfig;
use crate::core::{OwnerToken, Result, TxError};
use crate::transaction::{CompletionOutcome, HookResult, LifecycleHook, TransactionContext};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, trace, warn};

/// Acquires lease-based locks on a shared `LockStore`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use txweave::lock::{InMemoryLockStore, LockManager};
///
/// # tokio_test::block_on(async {
/// let locks = LockManager::new(Arc::new(InMemoryLockStore::new()));
///
/// let lock = locks.try_acquire("order:42", Duration::from_secs(2)).await.unwrap();
/// let lock = lock.expect("key is free");
/// assert!(locks.try_acquire("order:42", Duration::from_secs(2)).await.unwrap().is_none());
///
/// assert!(lock.release().await.unwrap());
/// # });
/// ```
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    config: TxConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_config(store, &TxConfig::default())
    }

    pub fn with_config(store: Arc<dyn LockStore>, config: &TxConfig) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    pub fn default_lease(&self) -> Duration {
        self.config.lease()
    }

    /// Try once with a fresh owner token.
    ///
    /// `Ok(None)` means another owner holds the key.
    pub async fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<DistributedLock>> {
        self.try_acquire_with_token(key, OwnerToken::generate(), lease)
            .await
    }

    /// Try once with a caller-chosen owner token (must be unique per acquisition).
    pub async fn try_acquire_with_token(
        &self,
        key: &str,
        owner: OwnerToken,
        lease: Duration,
    ) -> Result<Option<DistributedLock>> {
        if lease.is_zero() {
            return Err(TxError::Config("lock lease must be > 0".into()));
        }
        let period = self.config.renewal_period(lease);
        if period >= lease {
            return Err(TxError::Config(format!(
                "lock lease {:?} is too short to renew every {:?}",
                lease, period
            )));
        }

        if !self.store.add_if_absent(key, owner.as_str(), lease).await? {
            trace!(key, "lock held by another owner");
            return Ok(None);
        }

        let fence_key = format!("{}{}", key, self.config.lock_fence_suffix);
        let fencing_token = match self.store.increment(&fence_key, 1, None).await {
            Ok(token) => token.max(0) as u64,
            Err(err) => {
                // Do not keep a lock the caller never learns about.
                if let Err(cleanup) = self.store.compare_and_delete(key, owner.as_str()).await {
                    warn!(key, error = %cleanup, "cleanup after failed fence increment failed; lease will expire");
                }
                return Err(err);
            }
        };

        let lease_lost = Arc::new(AtomicBool::new(false));
        let renewal = LockRenewalWorker::spawn(
            self.store.clone(),
            key.to_string(),
            owner.clone(),
            lease,
            period,
            lease_lost.clone(),
        );

        debug!(key, owner = %owner, fencing_token, lease_ms = lease.as_millis() as u64, "lock acquired");

        Ok(Some(DistributedLock {
            key: key.to_string(),
            owner,
            lease,
            fencing_token,
            acquired_at: Instant::now(),
            store: self.store.clone(),
            lease_lost,
            renewal: Some(renewal),
        }))
    }

    /// Poll `try_acquire` on the configured fixed interval until `timeout`.
    pub async fn lock_wait(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<DistributedLock> {
        self.lock_wait_until(key, lease, timeout, futures::future::pending::<()>())
            .await
    }

    /// `lock_wait` with the configured default lease and timeout
    pub async fn lock_wait_default(&self, key: &str) -> Result<DistributedLock> {
        self.lock_wait(key, self.config.lease(), self.config.wait_timeout())
            .await
    }

    /// Like `lock_wait`, but gives up with `LockWaitCancelled` as soon as
    /// `cancel` completes.
    ///
    /// The poll interval is fixed; no backoff is applied.
    pub async fn lock_wait_until<C>(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
        cancel: C,
    ) -> Result<DistributedLock>
    where
        C: Future<Output = ()>,
    {
        let started = Instant::now();
        let deadline = started + timeout;
        tokio::pin!(cancel);

        loop {
            if let Some(lock) = self.try_acquire(key, lease).await? {
                return Ok(lock);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TxError::LockTimeout {
                    key: key.to_string(),
                    waited: now - started,
                });
            }

            let nap = self.config.poll_interval().min(deadline - now);
            tokio::select! {
                _ = &mut cancel => {
                    debug!(key, "lock wait cancelled");
                    return Err(TxError::LockWaitCancelled(key.to_string()));
                }
                _ = sleep(nap) => {}
            }
        }
    }

    /// Acquire, run `f`, release. The lock is released whether `f` succeeds or not.
    ///
    /// A release failure is returned only when `f` succeeded; otherwise `f`'s
    /// error wins and the release failure is logged.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<TxError>,
    {
        let lock = self.lock_wait(key, lease, timeout).await?;
        let result = f().await;
        match lock.release().await {
            Ok(true) => {}
            Ok(false) => warn!(key, "lease expired while the critical section was running"),
            Err(err) => {
                if result.is_err() {
                    warn!(key, error = %err, "lock release failed after the critical section failed");
                } else {
                    return Err(err.into());
                }
            }
        }
        result
    }

    /// Current owner of `key` according to the store
    pub async fn owner_of(&self, key: &str) -> Result<Option<OwnerToken>> {
        Ok(self.store.get(key).await?.map(OwnerToken::from))
    }
}

/// A held lease on one key.
///
/// Renewal runs in the background until `release` (or drop). Dropping
/// without releasing leaves the key to expire passively.
pub struct DistributedLock {
    key: String,
    owner: OwnerToken,
    lease: Duration,
    fencing_token: u64,
    acquired_at: Instant,
    store: Arc<dyn LockStore>,
    lease_lost: Arc<AtomicBool>,
    renewal: Option<LockRenewalWorker>,
}

impl DistributedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner_token(&self) -> &OwnerToken {
        &self.owner
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Monotonic per-key token; larger means a later acquisition
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Local view: false once a renewal found another owner.
    ///
    /// The store remains the arbiter; use `verify` for an authoritative answer.
    pub fn is_held(&self) -> bool {
        !self.lease_lost.load(Ordering::SeqCst)
    }

    /// Ask the store whether this token still owns the key
    pub async fn verify(&self) -> Result<bool> {
        let current = self.store.get(&self.key).await?;
        Ok(current.as_deref() == Some(self.owner.as_str()))
    }

    /// Stop renewal and delete the key if this token still owns it.
    ///
    /// Returns `Ok(false)` when the lease had already expired and the key was
    /// taken by someone else; that is not an error.
    pub async fn release(mut self) -> Result<bool> {
        if let Some(renewal) = self.renewal.take() {
            renewal.stop().await;
        }

        let released = self
            .store
            .compare_and_delete(&self.key, self.owner.as_str())
            .await?;

        if released {
            debug!(key = %self.key, owner = %self.owner, "lock released");
        } else {
            debug!(key = %self.key, owner = %self.owner, "lock already expired; release is a no-op");
        }
        Ok(released)
    }

    /// Hand the lock to the current transaction; it is released once the
    /// transaction reaches a terminal state, whatever the outcome.
    pub fn release_on_completion(self, ctx: &TransactionContext) -> Result<()> {
        let key = format!("lock:{}", self.key);
        ctx.register_keyed_hook(
            key,
            LockReleaseHook {
                lock: Mutex::new(Some(self)),
            },
        )
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("lease", &self.lease)
            .field("fencing_token", &self.fencing_token)
            .field("held", &self.is_held())
            .finish()
    }
}

struct LockReleaseHook {
    lock: Mutex<Option<DistributedLock>>,
}

#[async_trait]
impl LifecycleHook for LockReleaseHook {
    async fn after_completion(&self, outcome: CompletionOutcome) -> HookResult {
        let Some(lock) = self.lock.lock().await.take() else {
            return Ok(());
        };
        let key = lock.key.clone();
        let released = lock.release().await?;
        debug!(key = %key, %outcome, released, "lock released with transaction");
        Ok(())
    }
}

/// Background renewal tied to one lock's lifetime.
struct LockRenewalWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl LockRenewalWorker {
    fn spawn(
        store: Arc<dyn LockStore>,
        key: String,
        owner: OwnerToken,
        lease: Duration,
        period: Duration,
        lease_lost: Arc<AtomicBool>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = ticker.tick() => {
                        match store.compare_and_extend(&key, owner.as_str(), lease).await {
                            Ok(true) => {
                                trace!(key = %key, "lease renewed");
                            }
                            Ok(false) => {
                                // Another owner holds the key: our lease already ran out.
                                lease_lost.store(true, Ordering::SeqCst);
                                debug!(key = %key, owner = %owner, "lease lost; renewal stopped");
                                break;
                            }
                            Err(err) => {
                                warn!(key = %key, error = %err, "lease renewal failed; retrying next tick");
                            }
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Signals the worker to stop and waits for it to finish.
    async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            if let Err(err) = join_handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "lease renewal worker ended abnormally");
                }
            }
        }
    }
}

impl Drop for LockRenewalWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockStore;

    fn manager() -> (Arc<InMemoryLockStore>, LockManager) {
        let store = Arc::new(InMemoryLockStore::new());
        let config = TxConfig::default().lock_poll_interval(Duration::from_millis(10));
        (store.clone(), LockManager::with_config(store, &config))
    }

    #[tokio::test]
    async fn test_fencing_tokens_increase() {
        let (_store, locks) = manager();
        let first = locks.try_acquire("k", Duration::from_secs(5)).await.unwrap().unwrap();
        let first_token = first.fencing_token();
        first.release().await.unwrap();

        let second = locks.try_acquire("k", Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(second.fencing_token() > first_token);
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_store_is_not_contention() {
        let (store, locks) = manager();
        store.set_available(false);

        let err = locks.try_acquire("k", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TxError::LockUnavailable(_)));
    }

    #[tokio::test]
    async fn test_zero_lease_is_rejected() {
        let (_store, locks) = manager();
        assert!(locks.try_acquire("k", Duration::ZERO).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_times_out() {
        let (_store, locks) = manager();
        let held = locks.try_acquire("k", Duration::from_secs(30)).await.unwrap().unwrap();

        let err = locks
            .lock_wait("k", Duration::from_secs(1), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::LockTimeout { ref key, .. } if key == "k"));
        held.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_can_be_cancelled() {
        let (_store, locks) = manager();
        let held = locks.try_acquire("k", Duration::from_secs(30)).await.unwrap().unwrap();

        let err = locks
            .lock_wait_until(
                "k",
                Duration::from_secs(1),
                Duration::from_secs(60),
                sleep(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::LockWaitCancelled(_)));
        held.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_succeeds_after_release() {
        let (_store, locks) = manager();
        let held = locks.try_acquire("k", Duration::from_secs(30)).await.unwrap().unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .lock_wait("k", Duration::from_secs(5), Duration::from_secs(5))
                    .await
            })
        };

        sleep(Duration::from_millis(100)).await;
        held.release().await.unwrap();

        let lock = waiter.await.unwrap().unwrap();
        assert!(lock.verify().await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let (store, locks) = manager();

        let result: std::result::Result<(), TxError> = locks
            .with_lock("k", Duration::from_secs(5), Duration::from_secs(1), || async {
                Err(TxError::IllegalState("inside".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_keeps_body_error_when_release_fails() {
        let (store, locks) = manager();
        let offline = store.clone();

        let result: std::result::Result<(), TxError> = locks
            .with_lock("k", Duration::from_secs(5), Duration::from_secs(1), || async move {
                offline.set_available(false);
                Err(TxError::IllegalState("business".into()))
            })
            .await;

        assert!(matches!(result, Err(TxError::IllegalState(ref msg)) if msg == "business"));
    }

    #[tokio::test]
    async fn test_with_lock_reports_release_failure_after_success() {
        let (store, locks) = manager();
        let offline = store.clone();

        let result: std::result::Result<u32, TxError> = locks
            .with_lock("k", Duration::from_secs(5), Duration::from_secs(1), || async move {
                offline.set_available(false);
                Ok(7)
            })
            .await;

        assert!(matches!(result, Err(TxError::LockUnavailable(_))));
    }

    /// Fence counter always fails; everything else goes to the real store
    struct BrokenFence(Arc<InMemoryLockStore>);

    #[async_trait]
    impl LockStore for BrokenFence {
        async fn add_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.0.add_if_absent(key, value, ttl).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
            self.0.compare_and_delete(key, expected).await
        }

        async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
            self.0.compare_and_extend(key, expected, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn increment(&self, _key: &str, _delta: i64, _ttl: Option<Duration>) -> Result<i64> {
            Err(TxError::LockUnavailable("fence counter offline".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_fence_increment_frees_the_key() {
        let store = Arc::new(InMemoryLockStore::new());
        let locks = LockManager::new(Arc::new(BrokenFence(store.clone())));

        let err = locks.try_acquire("k", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TxError::LockUnavailable(_)));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_too_short_to_renew_is_rejected() {
        let (_store, locks) = manager();
        let err = locks.try_acquire("k", Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, TxError::Config(_)));
    }
}
