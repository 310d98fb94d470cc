/// Transaction lifecycle tests
///
/// Propagation, hook ordering and the guarded-call boundary
/// Run with: cargo test --test transaction_lifecycle_tests

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use txweave::transaction::{GuardedCall, NestedFallback, Transactional};
use txweave::{
    CompletionOutcome, Hook, Outcome, Propagation, TransactionContext, TransactionDefinition,
    TransactionInterceptor, TxConfig, TxError,
};

type Journal = Arc<Mutex<Vec<String>>>;

/// Hook that records every slot it fires in, tagged with `label`
fn journal_hook(journal: &Journal, label: &str) -> Hook {
    let (j1, j2, j3) = (journal.clone(), journal.clone(), journal.clone());
    let (l1, l2, l3) = (label.to_string(), label.to_string(), label.to_string());
    Hook::new()
        .on_before_process(move || {
            let (j, l) = (j1.clone(), l1.clone());
            async move {
                j.lock().unwrap().push(format!("{}:process", l));
                Ok(())
            }
        })
        .on_before_rollback(move || {
            let (j, l) = (j2.clone(), l2.clone());
            async move {
                j.lock().unwrap().push(format!("{}:rollback", l));
                Ok(())
            }
        })
        .on_after_completion(move |outcome| {
            let (j, l) = (j3.clone(), l3.clone());
            async move {
                j.lock().unwrap().push(format!("{}:{}", l, outcome));
                Ok(())
            }
        })
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

#[tokio::test]
async fn test_required_chain_commits_once() {
    let interceptor = TransactionInterceptor::default();
    let ctx = TransactionContext::new();
    let journal: Journal = Arc::default();

    let result: Result<(), TxError> = interceptor
        .execute(&ctx, None, |ctx| {
            let interceptor = interceptor.clone();
            let journal = journal.clone();
            async move {
                let outer = ctx.current_id();
                ctx.register_hook(journal_hook(&journal, "outer"))?;

                let inner_journal = journal.clone();
                interceptor
                    .execute(&ctx, None, |ctx| async move {
                        // REQUIRED inside REQUIRED joins
                        assert_eq!(ctx.current_id(), outer);
                        ctx.register_hook(journal_hook(&inner_journal, "inner"))?;
                        Ok::<_, TxError>(Outcome::Value(()))
                    })
                    .await?;

                // Joined commit is a no-op: nothing fired yet
                assert!(entries(&journal).is_empty());
                Ok(Outcome::Value(()))
            }
        })
        .await;

    assert_ok!(result);
    assert_eq!(
        entries(&journal),
        vec![
            "outer:process",
            "inner:process",
            "outer:COMMITTED",
            "inner:COMMITTED"
        ]
    );
    assert_eq!(ctx.depth(), 0);
}

#[tokio::test]
async fn test_rollback_only_is_sticky() {
    let interceptor = TransactionInterceptor::default();
    let ctx = TransactionContext::new();
    let journal: Journal = Arc::default();

    let result: Result<(), TxError> = interceptor
        .execute(&ctx, None, |ctx| {
            let interceptor = interceptor.clone();
            let journal = journal.clone();
            async move {
                ctx.register_hook(journal_hook(&journal, "tx"))?;
                let _: Result<(), TxError> = interceptor
                    .execute(&ctx, None, |_ctx| async {
                        Err(TxError::IllegalState("inner failure".into()))
                    })
                    .await;

                // Outer body carries on and asks for a commit anyway
                Ok(Outcome::Value(()))
            }
        })
        .await;

    let err = assert_err!(result);
    assert!(matches!(err, TxError::RollbackOnly(_)));
    assert_eq!(entries(&journal), vec!["tx:rollback", "tx:ROLLED_BACK"]);
}

#[tokio::test]
async fn test_requires_new_is_independent_of_outer_rollback() {
    let interceptor = TransactionInterceptor::default();
    let ctx = TransactionContext::new();
    let journal: Journal = Arc::default();
    let requires_new = TransactionDefinition::requires_new();

    let _: () = interceptor
        .execute(&ctx, None, |ctx| {
            let interceptor = interceptor.clone();
            let journal = journal.clone();
            async move {
                let outer = ctx.current_id();
                ctx.register_hook(journal_hook(&journal, "outer"))?;

                interceptor
                    .execute(&ctx, Some(&requires_new), |ctx| async move {
                        assert_ne!(ctx.current_id(), outer);
                        ctx.register_hook(journal_hook(&journal, "inner"))?;
                        Ok::<_, TxError>(Outcome::Value(()))
                    })
                    .await?;

                assert_eq!(ctx.current_id(), outer);
                Ok::<_, TxError>(Outcome::RollbackSignal(()))
            }
        })
        .await
        .unwrap();

    assert_eq!(
        entries(&journal),
        vec![
            "inner:process",
            "inner:COMMITTED",
            "outer:rollback",
            "outer:ROLLED_BACK"
        ]
    );
}

#[tokio::test]
async fn test_nested_child_rollback_keeps_parent() {
    let interceptor = TransactionInterceptor::default();
    let ctx = TransactionContext::new();
    let journal: Journal = Arc::default();
    let nested = TransactionDefinition::nested();

    let _: () = interceptor
        .execute(&ctx, None, |ctx| {
            let interceptor = interceptor.clone();
            let journal = journal.clone();
            async move {
                ctx.register_hook(journal_hook(&journal, "parent"))?;

                let committed = journal.clone();
                interceptor
                    .execute(&ctx, Some(&nested), |ctx| async move {
                        ctx.register_hook(journal_hook(&committed, "kept"))?;
                        Ok::<_, TxError>(Outcome::Value(()))
                    })
                    .await?;

                let rolled_back = journal.clone();
                let _ = interceptor
                    .execute(&ctx, Some(&nested), |ctx| async move {
                        ctx.register_hook(journal_hook(&rolled_back, "undone"))?;
                        Ok::<_, TxError>(Outcome::RollbackSignal(()))
                    })
                    .await?;

                assert!(!ctx.is_rollback_only());
                Ok::<_, TxError>(Outcome::Value(()))
            }
        })
        .await
        .unwrap();

    assert_eq!(
        entries(&journal),
        vec![
            "undone:rollback",
            "undone:ROLLED_BACK",
            "parent:process",
            "kept:process",
            "parent:COMMITTED",
            "kept:COMMITTED"
        ]
    );
}

#[tokio::test]
async fn test_nested_without_savepoints_can_be_rejected() {
    let config = TxConfig::default()
        .nested_savepoints(false)
        .nested_fallback(NestedFallback::Reject);
    let ctx = TransactionContext::with_config(&config);
    let interceptor = TransactionInterceptor::from_config(&config);
    let nested = TransactionDefinition::nested();

    let result: Result<(), TxError> = interceptor
        .execute(&ctx, None, |ctx| {
            let interceptor = interceptor.clone();
            async move {
                interceptor
                    .execute(&ctx, Some(&nested), |_ctx| async {
                        Ok::<_, TxError>(Outcome::Value(()))
                    })
                    .await?;
                Ok(Outcome::Value(()))
            }
        })
        .await;

    assert!(matches!(result, Err(TxError::NestedUnsupported)));
    assert_eq!(ctx.depth(), 0);
}

#[tokio::test]
async fn test_commit_hook_failure_rolls_back_and_surfaces() {
    let interceptor = TransactionInterceptor::default();
    let ctx = TransactionContext::new();
    let journal: Journal = Arc::default();

    let result: Result<(), TxError> = interceptor
        .execute(&ctx, None, |ctx| {
            let journal = journal.clone();
            async move {
                ctx.register_hook(Hook::new().on_before_process(|| async {
                    Err("constraint violated".into())
                }))?;
                ctx.register_hook(journal_hook(&journal, "second"))?;
                Ok(Outcome::Value(()))
            }
        })
        .await;

    let err = assert_err!(result);
    assert!(matches!(err, TxError::CommitHookFailure { .. }));
    // second before_process never ran; rollback and completion did
    assert_eq!(entries(&journal), vec!["second:rollback", "second:ROLLED_BACK"]);
    assert!(!ctx.has_transaction());
}

#[tokio::test]
async fn test_mandatory_and_never() {
    let interceptor = TransactionInterceptor::default();
    let ctx = TransactionContext::new();
    let mandatory = TransactionDefinition::new(Propagation::Mandatory);
    let never = TransactionDefinition::new(Propagation::Never);

    let result: Result<(), TxError> = interceptor
        .execute(&ctx, Some(&mandatory), |_ctx| async { Ok(Outcome::Value(())) })
        .await;
    assert!(matches!(result, Err(TxError::NoTransaction)));

    let result: Result<(), TxError> = interceptor
        .execute(&ctx, None, |ctx| {
            let interceptor = interceptor.clone();
            async move {
                interceptor
                    .execute(&ctx, Some(&never), |_ctx| async {
                        Ok::<_, TxError>(Outcome::Value(()))
                    })
                    .await?;
                Ok(Outcome::Value(()))
            }
        })
        .await;
    assert!(matches!(result, Err(TxError::ExistingTransaction(_))));
}

#[tokio::test]
async fn test_abandoned_call_still_rolls_back() {
    let interceptor = TransactionInterceptor::default();
    let ctx = TransactionContext::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let call = interceptor.execute(&ctx, None, |ctx| async move {
        ctx.register_hook(Hook::new().on_after_completion(move |outcome| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(outcome);
                Ok(())
            }
        }))?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, TxError>(Outcome::Value(()))
    });

    let timed_out = tokio::time::timeout(Duration::from_millis(20), call).await;
    assert!(timed_out.is_err());
    assert_eq!(ctx.depth(), 0);

    let outcome = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap();
    assert_eq!(outcome, Some(CompletionOutcome::RolledBack));
}

struct PlaceOrder;

#[async_trait]
impl GuardedCall<u32> for PlaceOrder {
    type Output = u32;
    type Error = TxError;

    async fn invoke(&self, ctx: TransactionContext, qty: u32) -> Result<Outcome<u32>, TxError> {
        assert!(ctx.has_transaction());
        if qty == 0 {
            return Ok(Outcome::RollbackSignal(0));
        }
        Ok(Outcome::Value(qty * 10))
    }
}

#[tokio::test]
async fn test_transactional_decorator() {
    let service = Transactional::new(PlaceOrder, TransactionInterceptor::default());
    let ctx = TransactionContext::new();

    let placed = service.invoke(ctx.clone(), 3).await.unwrap();
    assert_eq!(placed, Outcome::Value(30));

    // The signal is consumed by the decorator's own transaction
    let empty = service.invoke(ctx.clone(), 0).await.unwrap();
    assert_eq!(empty, Outcome::Value(0));
    assert_eq!(ctx.depth(), 0);
}
