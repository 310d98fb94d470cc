// ============================================================================
// Transaction Context
// ============================================================================
//
// The stack of transactions belonging to one logical execution. The top
// frame is the current transaction; frames below it are suspended.
//
// The context is an explicit object handed to guarded calls. Clones share
// the same stack and must stay inside the execution that created it.
//
// ============================================================================

use super::hook::{LifecycleHook, RegisteredHook};
use super::propagation::{NestedFallback, Propagation, TransactionDefinition};
use super::state::{Transaction, TransactionId, TransactionState};
use crate::config::TxConfig;
use crate::core::{Result, TxError};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// How a scope relates to the transaction it runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Created a new physical transaction
    New,

    /// Created a savepoint-style child of the current transaction
    Nested,

    /// Participates in an existing transaction owned by an outer scope
    Joined,

    /// Runs without a managed transaction
    Unmanaged,

    /// Suspended the current transaction and runs without one
    Suspended,
}

/// Handle returned by `get_transaction`; completes through `commit`/`rollback`.
#[must_use = "a scope must be completed with commit or rollback"]
#[derive(Debug)]
pub struct TransactionScope {
    kind: ScopeKind,
    tx_id: Option<TransactionId>,
    propagation: Propagation,
}

impl TransactionScope {
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// The transaction this scope runs in, if any
    pub fn tx_id(&self) -> Option<TransactionId> {
        self.tx_id
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// True if completing this scope performs a physical commit or rollback
    pub fn is_new_transaction(&self) -> bool {
        matches!(self.kind, ScopeKind::New | ScopeKind::Nested)
    }
}

enum Frame {
    Managed(Transaction),
    Suspension,
}

#[derive(Default)]
struct ContextStack {
    frames: Vec<Frame>,
}

impl ContextStack {
    fn current_mut(&mut self) -> Option<&mut Transaction> {
        match self.frames.last_mut() {
            Some(Frame::Managed(tx)) if tx.state() == TransactionState::Active => Some(tx),
            _ => None,
        }
    }

    fn current_id(&self) -> Option<TransactionId> {
        match self.frames.last() {
            Some(Frame::Managed(tx)) if tx.state() == TransactionState::Active => Some(tx.id()),
            _ => None,
        }
    }

    fn find_mut(&mut self, id: TransactionId) -> Option<&mut Transaction> {
        self.frames.iter_mut().rev().find_map(|frame| match frame {
            Frame::Managed(tx) if tx.id() == id => Some(tx),
            _ => None,
        })
    }

    fn pop_managed(&mut self, id: TransactionId) -> Result<Transaction> {
        match self.frames.last() {
            Some(Frame::Managed(tx)) if tx.id() == id => {}
            _ => {
                return Err(TxError::IllegalState(format!(
                    "transaction {} is not the innermost scope",
                    id
                )));
            }
        }
        match self.frames.pop() {
            Some(Frame::Managed(tx)) => Ok(tx),
            _ => Err(TxError::IllegalState(format!(
                "transaction {} vanished from the stack",
                id
            ))),
        }
    }

    fn pop_suspension(&mut self) -> Result<()> {
        match self.frames.last() {
            Some(Frame::Suspension) => {
                self.frames.pop();
                Ok(())
            }
            _ => Err(TxError::IllegalState(
                "suspension is not the innermost scope".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ContextSettings {
    nested_savepoints: bool,
    nested_fallback: NestedFallback,
}

/// Transaction stack of one logical execution.
///
/// # Examples
///
/// ```
/// use txweave::transaction::{TransactionContext, TransactionDefinition};
///
/// # tokio_test::block_on(async {
/// let ctx = TransactionContext::new();
/// let scope = ctx.get_transaction(&TransactionDefinition::required()).unwrap();
/// assert!(ctx.has_transaction());
/// ctx.commit(scope).await.unwrap();
/// assert!(!ctx.has_transaction());
/// # });
/// ```
#[derive(Clone)]
pub struct TransactionContext {
    stack: Arc<Mutex<ContextStack>>,
    settings: ContextSettings,
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionContext {
    /// Context with savepoint support for NESTED
    pub fn new() -> Self {
        Self::with_config(&TxConfig::default())
    }

    pub fn with_config(config: &TxConfig) -> Self {
        Self {
            stack: Arc::new(Mutex::new(ContextStack::default())),
            settings: ContextSettings {
                nested_savepoints: config.nested_savepoints,
                nested_fallback: config.nested_fallback,
            },
        }
    }

    // Never held across an await point.
    fn stack(&self) -> MutexGuard<'_, ContextStack> {
        self.stack.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True when the innermost frame is an active managed transaction
    pub fn has_transaction(&self) -> bool {
        self.stack().current_id().is_some()
    }

    pub fn current_id(&self) -> Option<TransactionId> {
        self.stack().current_id()
    }

    /// Number of frames, suspended ones included
    pub fn depth(&self) -> usize {
        self.stack().frames.len()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.stack()
            .current_mut()
            .map(|tx| tx.is_rollback_only())
            .unwrap_or(false)
    }

    /// Create or join a transaction according to `definition.propagation`.
    pub fn get_transaction(&self, definition: &TransactionDefinition) -> Result<TransactionScope> {
        let propagation = definition.propagation;
        let mut stack = self.stack();
        let current = stack.current_id();

        let joined = |id: TransactionId| TransactionScope {
            kind: ScopeKind::Joined,
            tx_id: Some(id),
            propagation,
        };
        let unmanaged = TransactionScope {
            kind: ScopeKind::Unmanaged,
            tx_id: None,
            propagation,
        };

        let scope = match (propagation, current) {
            (Propagation::Required, Some(id)) => joined(id),
            (Propagation::Required, None) | (Propagation::RequiresNew, _) => {
                Self::begin(&mut stack, definition, None)
            }
            (Propagation::Nested, None) => Self::begin(&mut stack, definition, None),
            (Propagation::Nested, Some(parent)) => {
                if self.settings.nested_savepoints {
                    Self::begin(&mut stack, definition, Some(parent))
                } else {
                    match self.settings.nested_fallback {
                        NestedFallback::Required => {
                            warn!(
                                tx_id = %parent,
                                "NESTED requested without savepoint support; joining as REQUIRED"
                            );
                            joined(parent)
                        }
                        NestedFallback::Reject => return Err(TxError::NestedUnsupported),
                    }
                }
            }
            (Propagation::Supports, Some(id)) | (Propagation::Mandatory, Some(id)) => joined(id),
            (Propagation::Supports, None) => unmanaged,
            (Propagation::Mandatory, None) => return Err(TxError::NoTransaction),
            (Propagation::Never, Some(id)) => return Err(TxError::ExistingTransaction(id)),
            (Propagation::Never, None) | (Propagation::NotSupported, None) => unmanaged,
            (Propagation::NotSupported, Some(id)) => {
                debug!(tx_id = %id, "suspending transaction for NOT_SUPPORTED");
                stack.frames.push(Frame::Suspension);
                TransactionScope {
                    kind: ScopeKind::Suspended,
                    tx_id: None,
                    propagation,
                }
            }
        };

        Ok(scope)
    }

    fn begin(
        stack: &mut ContextStack,
        definition: &TransactionDefinition,
        parent: Option<TransactionId>,
    ) -> TransactionScope {
        let id = TransactionId::new();
        let tx = Transaction::new(id, definition.propagation, definition.name.clone(), parent);
        debug!(
            tx_id = %id,
            propagation = %definition.propagation,
            parent = ?parent,
            depth = stack.frames.len(),
            "transaction started"
        );
        stack.frames.push(Frame::Managed(tx));
        TransactionScope {
            kind: if parent.is_some() {
                ScopeKind::Nested
            } else {
                ScopeKind::New
            },
            tx_id: Some(id),
            propagation: definition.propagation,
        }
    }

    /// Complete a scope successfully.
    ///
    /// Only scopes that created a transaction commit physically; a NESTED
    /// child hands its hooks to the parent instead of running them.
    ///
    /// # Errors
    /// - `RollbackOnly` when the transaction was flagged and got rolled back
    /// - `CommitHookFailure` when a `before_process` hook failed
    /// - `IllegalState` when the scope is not the innermost one
    pub async fn commit(&self, scope: TransactionScope) -> Result<()> {
        match scope.kind {
            ScopeKind::Joined | ScopeKind::Unmanaged => Ok(()),
            ScopeKind::Suspended => self.stack().pop_suspension(),
            ScopeKind::New | ScopeKind::Nested => {
                let id = Self::scope_id(&scope)?;
                let mut tx = self.stack().pop_managed(id)?;

                if scope.kind == ScopeKind::Nested && !tx.is_rollback_only() {
                    return self.release_into_parent(tx);
                }

                tx.process_commit().await
            }
        }
    }

    /// Complete a scope with a rollback.
    ///
    /// A participating (joined) scope cannot roll back on its own, so it
    /// flags the owning transaction rollback-only instead.
    pub async fn rollback(&self, scope: TransactionScope) -> Result<()> {
        match scope.kind {
            ScopeKind::Unmanaged => Ok(()),
            ScopeKind::Suspended => self.stack().pop_suspension(),
            ScopeKind::Joined => {
                let id = Self::scope_id(&scope)?;
                match self.stack().find_mut(id) {
                    Some(tx) => {
                        tx.set_rollback_only();
                        Ok(())
                    }
                    None => Err(TxError::IllegalState(format!(
                        "joined transaction {} is no longer on the stack",
                        id
                    ))),
                }
            }
            ScopeKind::New | ScopeKind::Nested => {
                let id = Self::scope_id(&scope)?;
                let mut tx = self.stack().pop_managed(id)?;
                tx.process_rollback().await
            }
        }
    }

    /// Remove an uncompleted scope synchronously, e.g. when its owner was
    /// dropped. Created transactions are rolled back on the current tokio
    /// runtime so their hooks still run.
    pub(crate) fn abandon(&self, scope: TransactionScope) {
        match scope.kind {
            ScopeKind::Unmanaged => {}
            ScopeKind::Suspended => {
                if let Err(err) = self.stack().pop_suspension() {
                    warn!(error = %err, "failed to resume after abandoned suspension");
                }
            }
            ScopeKind::Joined => {
                if let Some(id) = scope.tx_id {
                    if let Some(tx) = self.stack().find_mut(id) {
                        tx.set_rollback_only();
                    }
                }
            }
            ScopeKind::New | ScopeKind::Nested => {
                let Some(id) = scope.tx_id else { return };
                let popped = self.stack().pop_managed(id);
                let mut tx = match popped {
                    Ok(tx) => tx,
                    Err(err) => {
                        warn!(tx_id = %id, error = %err, "cannot abandon transaction");
                        return;
                    }
                };
                warn!(tx_id = %id, "transaction scope abandoned; rolling back");
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(err) = tx.process_rollback().await {
                                warn!(tx_id = %id, error = %err, "rollback of abandoned transaction failed");
                            }
                        });
                    }
                    Err(_) => {
                        warn!(
                            tx_id = %id,
                            "no runtime available; abandoned transaction skips every hook, so no cache rollback, lock release or TCC confirm/cancel is dispatched"
                        );
                    }
                }
            }
        }
    }

    fn scope_id(scope: &TransactionScope) -> Result<TransactionId> {
        scope
            .tx_id
            .ok_or_else(|| TxError::IllegalState("scope has no transaction".into()))
    }

    fn release_into_parent(&self, mut child: Transaction) -> Result<()> {
        let parent_id = child.parent().ok_or_else(|| {
            TxError::IllegalState(format!("nested transaction {} has no parent", child.id()))
        })?;
        let hooks = child.release_savepoint()?;
        let mut stack = self.stack();
        let parent = stack.find_mut(parent_id).ok_or_else(|| {
            TxError::IllegalState(format!(
                "parent {} of nested transaction {} is gone",
                parent_id,
                child.id()
            ))
        })?;
        debug!(
            tx_id = %child.id(),
            parent = %parent_id,
            hooks = hooks.len(),
            "savepoint released; hooks deferred to parent"
        );
        parent.absorb_hooks(hooks)
    }

    /// Flag the current transaction rollback-only.
    pub fn set_rollback_only(&self) -> Result<()> {
        let mut stack = self.stack();
        let tx = stack.current_mut().ok_or(TxError::NoTransaction)?;
        tx.set_rollback_only();
        Ok(())
    }

    /// Attach a hook to the current transaction.
    ///
    /// # Errors
    /// Returns `NoTransaction` if no transaction is active
    pub fn register_hook<H: LifecycleHook + 'static>(&self, hook: H) -> Result<()> {
        self.register(RegisteredHook::new(None, Box::new(hook)))
    }

    /// Attach a hook that replaces any earlier hook registered under `key`
    /// on the same transaction.
    pub fn register_keyed_hook<H: LifecycleHook + 'static>(
        &self,
        key: impl Into<String>,
        hook: H,
    ) -> Result<()> {
        self.register(RegisteredHook::new(Some(key.into()), Box::new(hook)))
    }

    /// Like `register_hook`, but returns false instead of failing without a transaction.
    pub fn try_register_hook<H: LifecycleHook + 'static>(&self, hook: H) -> bool {
        self.register_hook(hook).is_ok()
    }

    pub fn try_register_keyed_hook<H: LifecycleHook + 'static>(
        &self,
        key: impl Into<String>,
        hook: H,
    ) -> bool {
        self.register_keyed_hook(key, hook).is_ok()
    }

    fn register(&self, entry: RegisteredHook) -> Result<()> {
        let mut stack = self.stack();
        let tx = stack.current_mut().ok_or(TxError::NoTransaction)?;
        tx.register_hook(entry)
    }
}
