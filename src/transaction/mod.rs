// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Local transaction demarcation for guarded calls:
// - state:        Transaction state machine (State Pattern)
// - hook:         lifecycle callbacks fired on commit / rollback / completion
// - propagation:  join / suspend / nest policies
// - context:      per-execution transaction stack
// - interceptor:  begin / commit / rollback around a guarded call
//
// ============================================================================

pub mod context;
pub mod hook;
pub mod interceptor;
pub mod propagation;
pub mod state;

pub use context::{ScopeKind, TransactionContext, TransactionScope};
pub use hook::{CompletionOutcome, Hook, HookResult, LifecycleHook};
pub use interceptor::{GuardedCall, Outcome, TransactionInterceptor, Transactional};
pub use propagation::{NestedFallback, Propagation, TransactionDefinition};
pub use state::{Transaction, TransactionId, TransactionState};
