use crate::config::TxConfig;
use crate::core::{Result, TxError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Receives messages for one routing key. An `Err` asks for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, routing_key: &str, payload: &[u8]) -> Result<()>;
}

/// At-least-once, per-key ordered message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, routing_key: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;
}

/// A message that exhausted its deliveries
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub deliveries: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub published: u64,
    pub deliveries: u64,
    pub acknowledged: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct TransportStatsInner {
    published: AtomicU64,
    deliveries: AtomicU64,
    acknowledged: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

struct Queue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

struct TransportInner {
    queues: Mutex<HashMap<String, Queue>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    stats: TransportStatsInner,
    unavailable: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    redelivery_delay: Duration,
    max_deliveries: u32,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TransportInner {
    fn settle(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Process-local transport: one unbounded queue and one worker per routing key.
///
/// Messages published before anyone subscribes are buffered. A failed
/// delivery is retried in place after `redelivery_delay`, which keeps
/// per-key order; after `max_deliveries` attempts the message moves to the
/// dead-letter list.
pub struct InMemoryTransport {
    inner: Arc<TransportInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_config(&TxConfig::default())
    }

    pub fn with_config(config: &TxConfig) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                queues: Mutex::new(HashMap::new()),
                dead_letters: Mutex::new(Vec::new()),
                stats: TransportStatsInner::default(),
                unavailable: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                redelivery_delay: config.redelivery_delay(),
                max_deliveries: config.transport_max_deliveries.max(1),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a broker outage; `publish` fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        locked(&self.inner.dead_letters).clone()
    }

    /// Messages published but not yet acknowledged or dead-lettered
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TransportStats {
        let s = &self.inner.stats;
        TransportStats {
            published: s.published.load(Ordering::Relaxed),
            deliveries: s.deliveries.load(Ordering::Relaxed),
            acknowledged: s.acknowledged.load(Ordering::Relaxed),
            redelivered: s.redelivered.load(Ordering::Relaxed),
            dead_lettered: s.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Wait until nothing is in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let wait = async {
            loop {
                let notified = inner.idle.notified();
                if inner.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Stop all delivery workers. Buffered messages stay undelivered.
    pub fn shutdown(&self) {
        for worker in locked(&self.workers).drain(..) {
            worker.abort();
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn deliver(
    inner: &TransportInner,
    routing_key: &str,
    handler: &dyn MessageHandler,
    payload: Vec<u8>,
) {
    let mut attempt: u32 = 1;
    loop {
        inner.stats.deliveries.fetch_add(1, Ordering::Relaxed);
        match handler.handle(routing_key, &payload).await {
            Ok(()) => {
                inner.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) if attempt >= inner.max_deliveries => {
                error!(
                    routing_key,
                    deliveries = attempt,
                    error = %err,
                    "message dead-lettered"
                );
                inner.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                locked(&inner.dead_letters).push(DeadLetter {
                    routing_key: routing_key.to_string(),
                    payload,
                    deliveries: attempt,
                    last_error: err.to_string(),
                });
                return;
            }
            Err(err) => {
                warn!(routing_key, attempt, error = %err, "delivery failed; redelivering");
                inner.stats.redelivered.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(inner.redelivery_delay).await;
                attempt += 1;
            }
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TxError::Transport(format!(
                "transport unavailable; cannot publish to '{}'",
                routing_key
            )));
        }

        let mut queues = locked(&self.inner.queues);
        let queue = queues
            .entry(routing_key.to_string())
            .or_insert_with(Queue::new);

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        if queue.tx.send(payload).is_err() {
            self.inner.settle();
            return Err(TxError::Transport(format!(
                "queue '{}' is closed",
                routing_key
            )));
        }

        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
        debug!(routing_key, "message published");
        Ok(())
    }

    async fn subscribe(&self, routing_key: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut rx = {
            let mut queues = locked(&self.inner.queues);
            let queue = queues
                .entry(routing_key.to_string())
                .or_insert_with(Queue::new);
            queue.rx.take().ok_or_else(|| {
                TxError::Transport(format!("'{}' already has a subscriber", routing_key))
            })?
        };

        let inner = self.inner.clone();
        let key = routing_key.to_string();
        let worker = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                deliver(&inner, &key, handler.as_ref(), payload).await;
                inner.settle();
            }
        });

        locked(&self.workers).push(worker);
        debug!(routing_key, "subscribed");
        Ok(())
    }
}
