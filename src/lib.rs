// ============================================================================
// txweave Library
// ============================================================================

pub mod cache;
pub mod compensator;
pub mod config;
pub mod core;
pub mod lock;
pub mod tcc;
pub mod transaction;

// Re-export main types for convenience
pub use config::TxConfig;
pub use crate::core::{BoxError, OwnerToken, Result, StageId, TxError};
pub use transaction::{
    CompletionOutcome, Hook, LifecycleHook, Outcome, Propagation, TransactionContext,
    TransactionDefinition, TransactionInterceptor,
};

use lock::{LockManager, LockStore};
use std::sync::Arc;
use tcc::{TccCoordinator, Transport};

// ============================================================================
// Runtime facade
// ============================================================================

/// One configuration shared by the interceptor, lock manager and TCC
/// coordinator.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use txweave::lock::InMemoryLockStore;
/// use txweave::tcc::InMemoryTransport;
/// use txweave::{Outcome, TxConfig, TxError, TxRuntime};
///
/// # tokio_test::block_on(async {
/// let runtime = TxRuntime::new(
///     TxConfig::default(),
///     Arc::new(InMemoryLockStore::new()),
///     Arc::new(InMemoryTransport::new()),
/// )
/// .unwrap();
///
/// let ctx = runtime.context();
/// let answer = runtime
///     .interceptor()
///     .execute(&ctx, None, |_ctx| async { Ok::<_, TxError>(Outcome::Value(42)) })
///     .await
///     .unwrap();
/// assert_eq!(answer, 42);
/// # });
/// ```
#[derive(Clone)]
pub struct TxRuntime {
    config: TxConfig,
    interceptor: TransactionInterceptor,
    locks: LockManager,
    coordinator: TccCoordinator,
}

impl TxRuntime {
    /// Validate `config` and wire every component to it
    pub fn new(
        config: TxConfig,
        lock_store: Arc<dyn LockStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            interceptor: TransactionInterceptor::from_config(&config),
            locks: LockManager::with_config(lock_store, &config),
            coordinator: TccCoordinator::with_config(transport, &config),
            config,
        })
    }

    /// Fresh transaction context for one logical execution flow
    pub fn context(&self) -> TransactionContext {
        TransactionContext::with_config(&self.config)
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn interceptor(&self) -> &TransactionInterceptor {
        &self.interceptor
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn coordinator(&self) -> &TccCoordinator {
        &self.coordinator
    }
}
