/// Compensator tests
///
/// Cancellation racing completion across threads
/// Run with: cargo test --test compensator_tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;
use txweave::compensator::{
    Compensator, CompensatorHandle, CompensatorRegistry, CompensatorState, spawn_compensable,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_completion_has_one_outcome() {
    for round in 0..200 {
        let handle = CompensatorHandle::new("confirm", format!("stage-{}", round));
        let barrier = Arc::new(Barrier::new(2));

        let completer = {
            let handle = handle.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                handle.complete()
            })
        };
        let canceller = {
            let handle = handle.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                handle.cancel()
            })
        };

        let completed = completer.await.unwrap();
        let cancelled = canceller.await.unwrap();

        assert!(completed ^ cancelled, "round {}: exactly one claim wins", round);
        if completed {
            assert!(handle.is_done());
            assert!(!handle.is_cancelled());
        } else {
            assert!(handle.is_cancelled());
            assert!(!handle.is_done());
        }
    }
}

#[tokio::test]
async fn test_cancel_after_completion_is_refused() {
    let task = spawn_compensable("cancel", "stage-x", async { "released" });
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(task.is_done());
    assert!(!task.cancel());
    assert!(!task.is_cancelled());
    assert_eq!(task.join().await, Some("released"));
}

#[tokio::test]
async fn test_cancelled_task_never_runs_its_effect() {
    let effects = Arc::new(AtomicUsize::new(0));
    let e = effects.clone();
    let task = spawn_compensable("confirm", "stage-y", async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        e.fetch_add(1, Ordering::SeqCst);
    });

    assert!(task.cancel());
    assert_eq!(task.state(), CompensatorState::Cancelled);
    assert_eq!(task.join().await, None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(effects.load(Ordering::SeqCst), 0);
}

#[test]
fn test_registry_cancels_a_whole_group() {
    let registry = CompensatorRegistry::new();
    for i in 0..5 {
        registry.get_or_register("cancel", &format!("c{}", i));
    }
    registry.get_or_register("confirm", "keep");

    assert_eq!(registry.cancel_group("cancel"), 5);
    assert_eq!(registry.cancel_group("cancel"), 0);
    assert_eq!(registry.pending(), 1);
    assert!(!registry.get("confirm", "keep").unwrap().is_cancelled());
}
