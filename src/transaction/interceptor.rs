// ============================================================================
// Transaction Interceptor
// ============================================================================
//
// Wraps a guarded call with begin / commit / rollback. Two entry points:
// - `TransactionInterceptor::execute` for closures
// - `Transactional<S>`, a decorator over any `GuardedCall`
//
// ============================================================================

use super::context::{TransactionContext, TransactionScope};
use super::propagation::TransactionDefinition;
use crate::config::TxConfig;
use crate::core::TxError;
use async_trait::async_trait;
use std::future::Future;
use tracing::{debug, warn};

/// Result-level value of a guarded call.
///
/// `RollbackSignal` carries a value that is returned to the caller while
/// the transaction it ran in must not commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Value(T),
    RollbackSignal(T),
}

impl<T> Outcome<T> {
    pub fn is_rollback_signal(&self) -> bool {
        matches!(self, Outcome::RollbackSignal(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Outcome::Value(v) | Outcome::RollbackSignal(v) => v,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Value(v) => Outcome::Value(f(v)),
            Outcome::RollbackSignal(v) => Outcome::RollbackSignal(f(v)),
        }
    }
}

impl<T> From<T> for Outcome<T> {
    fn from(value: T) -> Self {
        Outcome::Value(value)
    }
}

/// Rolls an uncompleted scope back if the guarded future is dropped or panics.
struct ScopeGuard<'a> {
    ctx: &'a TransactionContext,
    scope: Option<TransactionScope>,
}

impl<'a> ScopeGuard<'a> {
    fn new(ctx: &'a TransactionContext, scope: TransactionScope) -> Self {
        Self {
            ctx,
            scope: Some(scope),
        }
    }

    fn disarm(&mut self) -> Option<TransactionScope> {
        self.scope.take()
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            self.ctx.abandon(scope);
        }
    }
}

/// Begin / commit / rollback around guarded calls.
///
/// # Examples
///
/// ```
/// use txweave::{Outcome, TransactionContext, TransactionInterceptor, TxError};
///
/// # tokio_test::block_on(async {
/// let interceptor = TransactionInterceptor::default();
/// let ctx = TransactionContext::new();
///
/// let value: i32 = interceptor
///     .execute(&ctx, None, |ctx| async move {
///         assert!(ctx.has_transaction());
///         Ok::<_, TxError>(Outcome::Value(42))
///     })
///     .await
///     .unwrap();
///
/// assert_eq!(value, 42);
/// assert!(!ctx.has_transaction());
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransactionInterceptor {
    default_definition: TransactionDefinition,
}

impl TransactionInterceptor {
    pub fn new(default_definition: TransactionDefinition) -> Self {
        Self { default_definition }
    }

    pub fn from_config(config: &TxConfig) -> Self {
        Self::new(config.default_definition())
    }

    pub fn default_definition(&self) -> &TransactionDefinition {
        &self.default_definition
    }

    /// Run `body` inside the transaction resolved from `definition`
    /// (or the process-wide default).
    ///
    /// * `Ok(Outcome::Value(v))` commits (a no-op for joined scopes) and returns `v`
    /// * `Ok(Outcome::RollbackSignal(v))` rolls back (or flags the joined
    ///   transaction rollback-only) and returns `v`
    /// * `Err(e)` rolls back (or flags) and returns `e` unchanged
    ///
    /// Commit failures are returned as `E::from(TxError)`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &TransactionContext,
        definition: Option<&TransactionDefinition>,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<Outcome<T>, E>>,
        E: From<TxError>,
    {
        let definition = definition.unwrap_or(&self.default_definition);
        let scope = ctx.get_transaction(definition).map_err(E::from)?;
        let tx_id = scope.tx_id();
        let kind = scope.kind();
        debug!(
            tx_id = ?tx_id,
            kind = ?kind,
            propagation = %definition.propagation,
            name = definition.name.as_deref().unwrap_or(""),
            "guarded call entered"
        );

        let mut guard = ScopeGuard::new(ctx, scope);
        let result = body(ctx.clone()).await;
        let Some(scope) = guard.disarm() else {
            return Err(E::from(TxError::IllegalState(
                "transaction scope lost during guarded call".into(),
            )));
        };

        match result {
            Ok(Outcome::Value(value)) => {
                ctx.commit(scope).await.map_err(E::from)?;
                Ok(value)
            }
            Ok(Outcome::RollbackSignal(value)) => {
                debug!(tx_id = ?tx_id, "guarded call returned rollback signal");
                ctx.rollback(scope).await.map_err(E::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = ctx.rollback(scope).await {
                    warn!(
                        tx_id = ?tx_id,
                        error = %rollback_err,
                        "rollback after failed guarded call did not complete"
                    );
                }
                Err(err)
            }
        }
    }
}

/// A callable unit of business logic that can be wrapped by middleware.
#[async_trait]
pub trait GuardedCall<A: Send + 'static>: Send + Sync {
    type Output: Send;
    type Error: From<TxError> + Send;

    async fn invoke(
        &self,
        ctx: TransactionContext,
        args: A,
    ) -> Result<Outcome<Self::Output>, Self::Error>;
}

/// Decorator that runs the wrapped call inside a transaction.
pub struct Transactional<S> {
    inner: S,
    interceptor: TransactionInterceptor,
    definition: Option<TransactionDefinition>,
}

impl<S> Transactional<S> {
    pub fn new(inner: S, interceptor: TransactionInterceptor) -> Self {
        Self {
            inner,
            interceptor,
            definition: None,
        }
    }

    /// Override the interceptor's default definition for this call site
    pub fn with_definition(mut self, definition: TransactionDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<A, S> GuardedCall<A> for Transactional<S>
where
    A: Send + 'static,
    S: GuardedCall<A>,
{
    type Output = S::Output;
    type Error = S::Error;

    async fn invoke(
        &self,
        ctx: TransactionContext,
        args: A,
    ) -> Result<Outcome<Self::Output>, Self::Error> {
        let inner = &self.inner;
        let value = self
            .interceptor
            .execute(&ctx, self.definition.as_ref(), move |ctx| {
                inner.invoke(ctx, args)
            })
            .await?;
        Ok(Outcome::Value(value))
    }
}
