// ============================================================================
// Transaction Lifecycle Hooks
// ============================================================================
//
// Callbacks attached to a transaction and fired by the lifecycle engine:
// - before_process:   exactly once, while committing, in registration order
// - before_rollback:  exactly once, while rolling back, in registration order
// - after_completion: exactly once, last, regardless of outcome
//
// ============================================================================

use crate::core::BoxError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;

pub type HookResult = std::result::Result<(), BoxError>;

/// Terminal outcome a transaction reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionOutcome {
    Committed,
    RolledBack,
}

impl std::fmt::Display for CompletionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionOutcome::Committed => write!(f, "COMMITTED"),
            CompletionOutcome::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Trait for components that need to take part in a transaction's lifecycle.
///
/// Every method has a no-op default, so implementors only override the
/// slots they care about. An error from `before_process` aborts the commit
/// and turns it into a rollback; errors from the other two slots are logged
/// and suppressed.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn before_process(&self) -> HookResult {
        Ok(())
    }

    async fn before_rollback(&self) -> HookResult {
        Ok(())
    }

    async fn after_completion(&self, _outcome: CompletionOutcome) -> HookResult {
        Ok(())
    }
}

type SlotFn = Box<dyn Fn() -> BoxFuture<'static, HookResult> + Send + Sync>;
type CompletionFn = Box<dyn Fn(CompletionOutcome) -> BoxFuture<'static, HookResult> + Send + Sync>;

/// Closure-backed hook with three optional slots.
///
/// # Examples
///
/// ```
/// use txweave::transaction::Hook;
///
/// let hook = Hook::new()
///     .on_before_rollback(|| async { Ok(()) })
///     .on_after_completion(|outcome| async move {
///         println!("finished: {}", outcome);
///         Ok(())
///     });
/// # let _ = hook;
/// ```
#[derive(Default)]
pub struct Hook {
    before_process: Option<SlotFn>,
    before_rollback: Option<SlotFn>,
    after_completion: Option<CompletionFn>,
}

impl Hook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_process<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.before_process = Some(Box::new(move || Box::pin(f())));
        self
    }

    pub fn on_before_rollback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.before_rollback = Some(Box::new(move || Box::pin(f())));
        self
    }

    pub fn on_after_completion<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CompletionOutcome) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.after_completion = Some(Box::new(move |outcome| Box::pin(f(outcome))));
        self
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("before_process", &self.before_process.is_some())
            .field("before_rollback", &self.before_rollback.is_some())
            .field("after_completion", &self.after_completion.is_some())
            .finish()
    }
}

#[async_trait]
impl LifecycleHook for Hook {
    async fn before_process(&self) -> HookResult {
        match &self.before_process {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    async fn before_rollback(&self) -> HookResult {
        match &self.before_rollback {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    async fn after_completion(&self, outcome: CompletionOutcome) -> HookResult {
        match &self.after_completion {
            Some(f) => f(outcome).await,
            None => Ok(()),
        }
    }
}

/// A hook as stored on a transaction, optionally keyed for replacement.
pub(crate) struct RegisteredHook {
    pub(crate) key: Option<String>,
    pub(crate) hook: Box<dyn LifecycleHook>,
}

impl RegisteredHook {
    pub(crate) fn new(key: Option<String>, hook: Box<dyn LifecycleHook>) -> Self {
        Self { key, hook }
    }
}

/// Append a hook, replacing an earlier one registered under the same key.
pub(crate) fn push_hook(hooks: &mut Vec<RegisteredHook>, entry: RegisteredHook) {
    if let Some(key) = entry.key.as_deref() {
        if let Some(existing) = hooks.iter_mut().find(|h| h.key.as_deref() == Some(key)) {
            *existing = entry;
            return;
        }
    }
    hooks.push(entry);
}
