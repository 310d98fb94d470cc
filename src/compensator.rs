// ============================================================================
// Compensators
// ============================================================================
//
// A compensator is a cancellable unit of work identified by (group, id).
// Its state moves once, from PENDING to either DONE or CANCELLED, through a
// single compare-and-swap; whichever of `complete` and `cancel` wins the CAS
// decides the outcome and the other observes the loss.
//
// ============================================================================

use lru::LruCache;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

const PENDING: u8 = 0;
const DONE: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompensatorState {
    Pending,
    Done,
    Cancelled,
}

impl CompensatorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            DONE => CompensatorState::Done,
            CANCELLED => CompensatorState::Cancelled,
            _ => CompensatorState::Pending,
        }
    }
}

/// A unit of work that can be cancelled before it finishes.
pub trait Compensator: Send + Sync {
    fn group(&self) -> &str;

    fn id(&self) -> &str;

    /// Returns true only for the caller whose cancel claim won.
    fn cancel(&self) -> bool;

    fn state(&self) -> CompensatorState;

    fn is_cancelled(&self) -> bool {
        self.state() == CompensatorState::Cancelled
    }

    fn is_done(&self) -> bool {
        self.state() == CompensatorState::Done
    }
}

struct HandleInner {
    group: String,
    id: String,
    state: AtomicU8,
    cancelled: Notify,
}

/// Shared atomic state for one compensator. Clones observe the same state.
#[derive(Clone)]
pub struct CompensatorHandle {
    inner: Arc<HandleInner>,
}

impl CompensatorHandle {
    pub fn new(group: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                group: group.into(),
                id: id.into(),
                state: AtomicU8::new(PENDING),
                cancelled: Notify::new(),
            }),
        }
    }

    /// Claim `Done`. False if the handle was cancelled (or already done).
    pub fn complete(&self) -> bool {
        self.transition(DONE)
    }

    /// Resolves once the handle is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.cancelled.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Compensator for CompensatorHandle {
    fn group(&self) -> &str {
        &self.inner.group
    }

    fn id(&self) -> &str {
        &self.inner.id
    }

    fn cancel(&self) -> bool {
        let won = self.transition(CANCELLED);
        if won {
            self.inner.cancelled.notify_waiters();
            debug!(group = %self.inner.group, id = %self.inner.id, "compensator cancelled");
        }
        won
    }

    fn state(&self) -> CompensatorState {
        CompensatorState::from_u8(self.inner.state.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for CompensatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensatorHandle")
            .field("group", &self.inner.group)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

type HandleKey = (String, String);

/// Compensators indexed by (group, id), cancellable individually or per group.
///
/// The registry is bounded; once full, the least recently touched handle is
/// forgotten. Clones of a forgotten handle keep working.
pub struct CompensatorRegistry {
    handles: Mutex<LruCache<HandleKey, CompensatorHandle>>,
}

impl CompensatorRegistry {
    pub const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(4096) {
        Some(capacity) => capacity,
        None => NonZeroUsize::MIN,
    };

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            handles: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn handles(&self) -> MutexGuard<'_, LruCache<HandleKey, CompensatorHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(group: &str, id: &str) -> HandleKey {
        (group.to_string(), id.to_string())
    }

    /// Track `handle`, replacing any earlier handle with the same group and id.
    pub fn register(&self, handle: CompensatorHandle) {
        let key = Self::key(handle.group(), handle.id());
        self.handles().put(key, handle);
    }

    /// Existing handle for (`group`, `id`), or a fresh pending one.
    pub fn get_or_register(&self, group: &str, id: &str) -> CompensatorHandle {
        let key = Self::key(group, id);
        let mut handles = self.handles();
        if let Some(handle) = handles.get(&key) {
            return handle.clone();
        }
        let handle = CompensatorHandle::new(group, id);
        handles.put(key, handle.clone());
        handle
    }

    pub fn get(&self, group: &str, id: &str) -> Option<CompensatorHandle> {
        self.handles().get(&Self::key(group, id)).cloned()
    }

    /// Stop tracking (`group`, `id`).
    pub fn remove(&self, group: &str, id: &str) -> Option<CompensatorHandle> {
        self.handles().pop(&Self::key(group, id))
    }

    /// Cancel one compensator. A cancel for an unknown (group, id) is recorded
    /// as a cancelled handle, so later work under that id is skipped.
    pub fn cancel(&self, group: &str, id: &str) -> bool {
        self.get_or_register(group, id).cancel()
    }

    /// Cancel every pending compensator in `group`; returns how many were cancelled.
    pub fn cancel_group(&self, group: &str) -> usize {
        let handles: Vec<CompensatorHandle> = self
            .handles()
            .iter()
            .filter(|(_, h)| h.group() == group)
            .map(|(_, h)| h.clone())
            .collect();
        handles.iter().filter(|h| h.cancel()).count()
    }

    /// Drop handles that reached `Done`; cancelled handles stay as tombstones.
    pub fn prune(&self) -> usize {
        let mut handles = self.handles();
        let done: Vec<HandleKey> = handles
            .iter()
            .filter(|(_, h)| h.is_done())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &done {
            handles.pop(key);
        }
        done.len()
    }

    pub fn pending(&self) -> usize {
        self.handles()
            .iter()
            .filter(|(_, h)| h.state() == CompensatorState::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CompensatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A spawned future that can be cancelled through the `Compensator` API.
pub struct CompensableTask<T> {
    handle: CompensatorHandle,
    join: JoinHandle<Option<T>>,
}

/// Run `future` on the tokio runtime under a fresh compensator handle.
///
/// The task stops at its next await point once cancelled, and its result is
/// only kept if `complete` wins over `cancel`.
///
/// # Examples
///
/// ```
/// use txweave::compensator::{Compensator, spawn_compensable};
///
/// # tokio_test::block_on(async {
/// let task = spawn_compensable("confirm", "stage-1", async { 7 });
/// assert_eq!(task.join().await, Some(7));
/// # });
/// ```
pub fn spawn_compensable<F, T>(
    group: impl Into<String>,
    id: impl Into<String>,
    future: F,
) -> CompensableTask<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handle = CompensatorHandle::new(group, id);
    let task_handle = handle.clone();

    let join = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = task_handle.cancelled() => None,
            value = future => {
                if task_handle.complete() { Some(value) } else { None }
            }
        }
    });

    CompensableTask { handle, join }
}

impl<T> CompensableTask<T> {
    pub fn handle(&self) -> &CompensatorHandle {
        &self.handle
    }

    /// Wait for the task. `None` if it was cancelled before completing.
    pub async fn join(self) -> Option<T> {
        match self.join.await {
            Ok(value) => value,
            Err(err) => {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
                None
            }
        }
    }
}

impl<T: Send> Compensator for CompensableTask<T> {
    fn group(&self) -> &str {
        self.handle.group()
    }

    fn id(&self) -> &str {
        self.handle.id()
    }

    fn cancel(&self) -> bool {
        let won = self.handle.cancel();
        if won {
            self.join.abort();
        }
        won
    }

    fn state(&self) -> CompensatorState {
        self.handle.state()
    }
}
