// ============================================================================
// Transaction State Management
// ============================================================================
//
// Implements the State Pattern for the transaction lifecycle:
//
//   Active ──commit──> Committing ──> Committed
//     │                    │
//     │                    └─hook failure─┐
//     │                                   v
//     └──rollback──────────────────> RollingBack ──> RolledBack
//
// Transitions are monotonic; nothing leaves a terminal state.
//
// ============================================================================

use super::hook::{CompletionOutcome, RegisteredHook, push_hook};
use super::propagation::Propagation;
use crate::core::{Result, TxError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and accepts hooks
    Active,

    /// `before_process` hooks are running
    Committing,

    /// Transaction has been successfully committed
    Committed,

    /// `before_rollback` hooks are running
    RollingBack,

    /// Transaction has been rolled back
    RolledBack,
}

impl TransactionState {
    /// Check if transaction can accept hooks
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Check if transaction is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }

    fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Active, Committing)
                | (Active, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committing => write!(f, "COMMITTING"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RollingBack => write!(f, "ROLLING_BACK"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// A managed transaction
///
/// # Thread Safety
/// Owned by exactly one `TransactionContext` stack frame. Hooks are
/// registered only by the execution that owns the context, and never
/// while the lifecycle algorithms are running.
pub struct Transaction {
    /// Unique transaction identifier
    id: TransactionId,

    propagation: Propagation,

    name: Option<String>,

    state: TransactionState,

    /// Enclosing transaction for NESTED children (by id, never owned)
    parent: Option<TransactionId>,

    /// Sticky: once set, commit turns into rollback
    rollback_only: bool,

    hooks: Vec<RegisteredHook>,

    /// Start time for diagnostics
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn new(
        id: TransactionId,
        propagation: Propagation,
        name: Option<String>,
        parent: Option<TransactionId>,
    ) -> Self {
        Self {
            id,
            propagation,
            name,
            state: TransactionState::Active,
            parent,
            rollback_only: false,
            hooks: Vec::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Option<TransactionId> {
        self.parent
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Flag the transaction so that commit turns into rollback. Cannot be undone.
    pub fn set_rollback_only(&mut self) {
        if !self.rollback_only {
            debug!(tx_id = %self.id, "transaction marked rollback-only");
        }
        self.rollback_only = true;
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Attach a hook; a keyed hook replaces an earlier one with the same key.
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub(crate) fn register_hook(&mut self, entry: RegisteredHook) -> Result<()> {
        if !self.state.is_active() {
            return Err(TxError::IllegalState(format!(
                "Cannot register hook: transaction {} is {}",
                self.id, self.state
            )));
        }
        push_hook(&mut self.hooks, entry);
        Ok(())
    }

    /// Move hooks from a nested child onto this transaction.
    pub(crate) fn absorb_hooks(&mut self, hooks: Vec<RegisteredHook>) -> Result<()> {
        if !self.state.is_active() {
            return Err(TxError::IllegalState(format!(
                "Cannot absorb hooks: transaction {} is {}",
                self.id, self.state
            )));
        }
        for entry in hooks {
            push_hook(&mut self.hooks, entry);
        }
        Ok(())
    }

    fn transition(&mut self, next: TransactionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TxError::IllegalState(format!(
                "Transaction {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Release a NESTED savepoint: the child is done, its hooks now belong to the parent.
    pub(crate) fn release_savepoint(&mut self) -> Result<Vec<RegisteredHook>> {
        self.transition(TransactionState::Committing)?;
        self.transition(TransactionState::Committed)?;
        Ok(std::mem::take(&mut self.hooks))
    }

    /// Run the commit algorithm.
    ///
    /// # Errors
    /// - `RollbackOnly` if the transaction was flagged; it is rolled back instead
    /// - `CommitHookFailure` if a `before_process` hook failed; it is rolled back instead
    pub(crate) async fn process_commit(&mut self) -> Result<()> {
        if self.rollback_only {
            debug!(tx_id = %self.id, "commit requested on rollback-only transaction");
            self.process_rollback().await?;
            return Err(TxError::RollbackOnly(self.id));
        }

        self.transition(TransactionState::Committing)?;

        let mut failure = None;
        for entry in &self.hooks {
            if let Err(err) = entry.hook.before_process().await {
                failure = Some(err.to_string());
                break;
            }
        }

        if let Some(reason) = failure {
            warn!(tx_id = %self.id, error = %reason, "before_process hook failed; rolling back");
            self.process_rollback().await?;
            return Err(TxError::CommitHookFailure {
                tx_id: self.id,
                reason,
            });
        }

        self.transition(TransactionState::Committed)?;
        debug!(tx_id = %self.id, hooks = self.hooks.len(), "transaction committed");
        self.fire_after_completion(CompletionOutcome::Committed).await;
        Ok(())
    }

    /// Run the rollback algorithm. Hook failures are logged and suppressed.
    pub(crate) async fn process_rollback(&mut self) -> Result<()> {
        self.transition(TransactionState::RollingBack)?;

        for entry in &self.hooks {
            if let Err(err) = entry.hook.before_rollback().await {
                warn!(tx_id = %self.id, error = %err, "before_rollback hook failed");
            }
        }

        self.transition(TransactionState::RolledBack)?;
        debug!(tx_id = %self.id, hooks = self.hooks.len(), "transaction rolled back");
        self.fire_after_completion(CompletionOutcome::RolledBack).await;
        Ok(())
    }

    async fn fire_after_completion(&mut self, outcome: CompletionOutcome) {
        let hooks = std::mem::take(&mut self.hooks);
        for entry in &hooks {
            if let Err(err) = entry.hook.after_completion(outcome).await {
                warn!(tx_id = %self.id, %outcome, error = %err, "after_completion hook failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("propagation", &self.propagation)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("rollback_only", &self.rollback_only)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
