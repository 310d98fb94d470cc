/// Distributed lock tests
///
/// Lease exclusivity, renewal, stale owners and transaction-bound release
/// Run with: cargo test --test distributed_lock_tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::assert_ok;
use txweave::lock::{InMemoryLockStore, LockManager, LockStore};
use txweave::{Outcome, TransactionContext, TransactionInterceptor, TxConfig, TxError};

fn manager(store: &Arc<InMemoryLockStore>, config: &TxConfig) -> LockManager {
    LockManager::with_config(store.clone(), config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquirers_are_exclusive() {
    let store = Arc::new(InMemoryLockStore::new());
    let config = TxConfig::default().lock_poll_interval(Duration::from_millis(2));
    let locks = manager(&store, &config);

    let inside = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicUsize::new(0));

    let mut handles = vec![];
    for _ in 0..8 {
        let locks = locks.clone();
        let inside = inside.clone();
        let entered = entered.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let lock = locks
                    .lock_wait("shared", Duration::from_secs(5), Duration::from_secs(10))
                    .await
                    .unwrap();

                assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                entered.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.store(false, Ordering::SeqCst);

                assert!(lock.release().await.unwrap());
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(entered.load(Ordering::SeqCst), 40);
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_keeps_short_lease_alive() {
    let store = Arc::new(InMemoryLockStore::new());
    let config = TxConfig::default().lock_renewal_interval(Duration::from_secs(1));
    let locks = manager(&store, &config);
    let rival = manager(&store, &config);

    let lock = locks
        .try_acquire("job", Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();

    // Hold well past the lease; renewal every second keeps it
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(lock.is_held());
    assert!(lock.verify().await.unwrap());
    assert!(rival.try_acquire("job", Duration::from_secs(2)).await.unwrap().is_none());

    assert!(lock.release().await.unwrap());
    let next = rival.try_acquire("job", Duration::from_secs(2)).await.unwrap();
    assert!(next.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_short_lease_renews_faster_than_fixed_interval() {
    let store = Arc::new(InMemoryLockStore::new());
    let config = TxConfig::default().lock_renewal_interval(Duration::from_secs(1));
    assert_ok!(config.validate());
    let locks = manager(&store, &config);
    let rival = manager(&store, &config);

    let holder = locks
        .try_acquire("k", Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(holder.is_held());
    assert!(rival.try_acquire("k", Duration::from_millis(500)).await.unwrap().is_none());
    assert!(holder.release().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_stale_owner_cannot_touch_new_lease() {
    let store = Arc::new(InMemoryLockStore::new());
    let config = TxConfig::default().lock_renewal_interval(Duration::from_secs(1));
    let locks = manager(&store, &config);

    let stale = locks
        .try_acquire("job", Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();

    // Lease runs out (e.g. a long GC pause) and someone else takes the key
    store.force_expire("job").await;
    let fresh = locks
        .try_acquire("job", Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert!(fresh.fencing_token() > stale.fencing_token());

    // The stale renewal tick finds another owner and gives up
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(!stale.is_held());
    assert!(!stale.verify().await.unwrap());

    assert!(!stale.release().await.unwrap());
    assert_eq!(
        store.get("job").await.unwrap().as_deref(),
        Some(fresh.owner_token().as_str())
    );
    assert!(fresh.release().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_lock_expires_passively() {
    let store = Arc::new(InMemoryLockStore::new());
    let config = TxConfig::default().lock_renewal_interval(Duration::from_secs(1));
    let locks = manager(&store, &config);

    let lock = locks.try_acquire("job", Duration::from_secs(2)).await.unwrap();
    drop(lock);

    assert!(locks.try_acquire("job", Duration::from_secs(2)).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(locks.try_acquire("job", Duration::from_secs(2)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_lock_released_with_transaction() {
    let store = Arc::new(InMemoryLockStore::new());
    let locks = manager(&store, &TxConfig::default());
    let interceptor = TransactionInterceptor::default();
    let ctx = TransactionContext::new();

    for signal_rollback in [false, true] {
        let held_locks = locks.clone();
        let observed = store.clone();
        let result: Result<(), TxError> = interceptor
            .execute(&ctx, None, |ctx| async move {
                let lock = held_locks
                    .try_acquire("order:7", Duration::from_secs(30))
                    .await?
                    .ok_or_else(|| TxError::IllegalState("busy".into()))?;
                lock.release_on_completion(&ctx)?;

                // Still held until the transaction ends
                assert!(observed.get("order:7").await?.is_some());
                if signal_rollback {
                    Ok(Outcome::RollbackSignal(()))
                } else {
                    Ok(Outcome::Value(()))
                }
            })
            .await;

        assert_ok!(result);
        assert!(store.get("order:7").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_release_on_completion_needs_transaction() {
    let store = Arc::new(InMemoryLockStore::new());
    let locks = manager(&store, &TxConfig::default());
    let ctx = TransactionContext::new();

    let lock = locks
        .try_acquire("k", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    let err = lock.release_on_completion(&ctx).unwrap_err();
    assert!(matches!(err, TxError::NoTransaction));
}
