use super::stage::{PayloadCodec, Stage, StageName, StageState};
use super::transport::Transport;
use super::try_info::TryInfo;
use crate::config::TxConfig;
use crate::core::{Result, StageId};
use crate::transaction::{CompletionOutcome, HookResult, LifecycleHook, TransactionContext};
use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// `{prefix}.{target}`
pub fn routing_key(prefix: &str, target: &str) -> String {
    format!("{}.{}", prefix, target)
}

/// Bounded record of the most recent stage states, for inspection.
pub struct StageLedger {
    states: Mutex<LruCache<StageId, StageState>>,
}

impl StageLedger {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            states: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn record(&self, stage_id: StageId, state: StageState) {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .put(stage_id, state);
    }

    pub fn get(&self, stage_id: &StageId) -> Option<StageState> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .peek(stage_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub captured: u64,
    pub confirms_dispatched: u64,
    pub cancels_dispatched: u64,
    pub dispatch_failures: u64,
}

#[derive(Default)]
struct CoordinatorStatsInner {
    captured: AtomicU64,
    confirms_dispatched: AtomicU64,
    cancels_dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
}

struct CoordinatorInner {
    transport: Arc<dyn Transport>,
    routing_prefix: String,
    codec: PayloadCodec,
    ledger: Arc<StageLedger>,
    stats: CoordinatorStatsInner,
}

impl CoordinatorInner {
    async fn dispatch(&self, try_info: TryInfo, outcome: CompletionOutcome) {
        let stage = Stage::new(StageName::from_outcome(outcome), try_info);
        let stage_id = stage.stage_id;
        let key = routing_key(&self.routing_prefix, &stage.try_info.target);

        let published = match stage.encode(self.codec) {
            Ok(payload) => self.transport.publish(&key, payload).await,
            Err(err) => Err(err),
        };

        match published {
            Ok(()) => {
                let counter = match stage.stage_name {
                    StageName::Confirm => &self.stats.confirms_dispatched,
                    StageName::Cancel => &self.stats.cancels_dispatched,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.ledger.record(stage_id, StageState::Dispatched);
                debug!(
                    stage_id = %stage_id,
                    stage = %stage.stage_name,
                    routing_key = %key,
                    "stage dispatched"
                );
            }
            Err(err) => {
                // The transaction outcome is final; this stage is lost.
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                self.ledger.record(stage_id, StageState::Failed);
                error!(
                    stage_id = %stage_id,
                    stage = %stage.stage_name,
                    routing_key = %key,
                    error = %err,
                    "stage dispatch failed"
                );
            }
        }
    }
}

/// Turns captured Try phases into Confirm or Cancel messages once the
/// owning transaction completes.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use txweave::tcc::{InMemoryTransport, TccCoordinator, TryInfo};
/// use txweave::{Outcome, TransactionContext, TransactionInterceptor, TxError};
///
/// # tokio_test::block_on(async {
/// let transport = Arc::new(InMemoryTransport::new());
/// let coordinator = TccCoordinator::new(transport.clone());
/// let ctx = TransactionContext::new();
///
/// let _: () = TransactionInterceptor::default()
///     .execute(&ctx, None, |ctx| async move {
///         coordinator.register_try(&ctx, TryInfo::new("inventory", "reserve"))?;
///         Ok::<_, TxError>(Outcome::Value(()))
///     })
///     .await
///     .unwrap();
///
/// assert_eq!(transport.stats().published, 1);
/// # });
/// ```
#[derive(Clone)]
pub struct TccCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TccCoordinator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, &TxConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: &TxConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.tcc_ledger_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(CoordinatorInner {
                transport,
                routing_prefix: config.tcc_routing_prefix.clone(),
                codec: config.tcc_payload_codec,
                ledger: Arc::new(StageLedger::new(capacity)),
                stats: CoordinatorStatsInner::default(),
            }),
        }
    }

    /// Capture a Try phase on the current transaction.
    ///
    /// Exactly one stage is dispatched for it after the transaction ends:
    /// Confirm if it committed, Cancel if it rolled back. Registering the
    /// same `TryInfo` twice in one transaction still dispatches once.
    ///
    /// # Errors
    /// `NoTransaction` outside an active transaction
    pub fn register_try(&self, ctx: &TransactionContext, try_info: TryInfo) -> Result<StageId> {
        let stage_id = try_info.stage_id;
        let target = try_info.target.clone();

        ctx.register_keyed_hook(
            format!("tcc:{}", stage_id),
            DispatchHook {
                coordinator: self.inner.clone(),
                try_info: Mutex::new(Some(try_info)),
            },
        )?;

        self.inner.stats.captured.fetch_add(1, Ordering::Relaxed);
        self.inner.ledger.record(stage_id, StageState::Captured);
        debug!(stage_id = %stage_id, target = %target, tx_id = ?ctx.current_id(), "try captured");
        Ok(stage_id)
    }

    pub fn routing_key(&self, target: &str) -> String {
        routing_key(&self.inner.routing_prefix, target)
    }

    pub fn codec(&self) -> PayloadCodec {
        self.inner.codec
    }

    /// Shared so an in-process consumer can report execution
    pub fn ledger(&self) -> Arc<StageLedger> {
        self.inner.ledger.clone()
    }

    pub fn stage_state(&self, stage_id: &StageId) -> Option<StageState> {
        self.inner.ledger.get(stage_id)
    }

    pub fn stats(&self) -> CoordinatorStats {
        let s = &self.inner.stats;
        CoordinatorStats {
            captured: s.captured.load(Ordering::Relaxed),
            confirms_dispatched: s.confirms_dispatched.load(Ordering::Relaxed),
            cancels_dispatched: s.cancels_dispatched.load(Ordering::Relaxed),
            dispatch_failures: s.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

struct DispatchHook {
    coordinator: Arc<CoordinatorInner>,
    try_info: Mutex<Option<TryInfo>>,
}

#[async_trait]
impl LifecycleHook for DispatchHook {
    async fn after_completion(&self, outcome: CompletionOutcome) -> HookResult {
        let taken = self
            .try_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(try_info) = taken {
            self.coordinator.dispatch(try_info, outcome).await;
        }
        Ok(())
    }
}
