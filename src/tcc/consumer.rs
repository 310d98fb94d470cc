use super::coordinator::{StageLedger, routing_key};
use super::stage::{PayloadCodec, Stage, StageName, StageState};
use super::transport::{MessageHandler, Transport};
use super::try_info::TryInfo;
use crate::compensator::{Compensator, CompensatorRegistry};
use crate::config::TxConfig;
use crate::core::{BoxError, Result, StageId, TxError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Confirm / Cancel handlers for one target.
///
/// Stages are delivered at least once, so both methods must be idempotent.
#[async_trait]
pub trait TccParticipant: Send + Sync {
    async fn confirm(&self, try_info: &TryInfo) -> std::result::Result<(), BoxError>;

    async fn cancel(&self, try_info: &TryInfo) -> std::result::Result<(), BoxError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct ConsumerStatsInner {
    executed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Executes Confirm / Cancel stages against registered participants.
pub struct TccConsumer {
    participants: RwLock<HashMap<String, Arc<dyn TccParticipant>>>,
    routing_prefix: String,
    codec: PayloadCodec,
    compensators: Arc<CompensatorRegistry>,
    ledger: Option<Arc<StageLedger>>,
    stats: ConsumerStatsInner,
}

impl TccConsumer {
    pub fn new() -> Self {
        Self::with_config(&TxConfig::default())
    }

    pub fn with_config(config: &TxConfig) -> Self {
        Self {
            participants: RwLock::new(HashMap::new()),
            routing_prefix: config.tcc_routing_prefix.clone(),
            codec: config.tcc_payload_codec,
            compensators: Arc::new(CompensatorRegistry::with_capacity(
                NonZeroUsize::new(config.tcc_ledger_capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ledger: None,
            stats: ConsumerStatsInner::default(),
        }
    }

    /// Report `Executed` / `Failed` into a coordinator's ledger
    pub fn with_ledger(mut self, ledger: Arc<StageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn register_participant(&self, target: impl Into<String>, participant: Arc<dyn TccParticipant>) {
        let target = target.into();
        debug!(target = %target, "participant registered");
        self.participants
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target, participant);
    }

    fn participant(&self, target: &str) -> Option<Arc<dyn TccParticipant>> {
        self.participants
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(target)
            .cloned()
    }

    fn targets(&self) -> Vec<String> {
        self.participants
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Subscribe this consumer to the routing key of every registered target.
    pub async fn subscribe_all(self: &Arc<Self>, transport: &dyn Transport) -> Result<usize> {
        let targets = self.targets();
        for target in &targets {
            let key = routing_key(&self.routing_prefix, target);
            transport.subscribe(&key, self.clone()).await?;
        }
        Ok(targets.len())
    }

    /// Run one stage against its participant.
    ///
    /// A stage whose compensator was cancelled is skipped and reported as
    /// handled. A handler failure returns `CompensationHandlerFailure` so the
    /// transport redelivers.
    pub async fn execute(&self, stage: &Stage) -> Result<()> {
        let stage_id = stage.stage_id;
        let handle = self
            .compensators
            .get_or_register(stage.stage_name.as_str(), &stage_id.to_string());

        if handle.is_cancelled() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            info!(stage_id = %stage_id, stage = %stage.stage_name, "stage cancelled; skipping");
            return Ok(());
        }

        let target = &stage.try_info.target;
        let Some(participant) = self.participant(target) else {
            self.record_failure(stage_id);
            return Err(TxError::CompensationHandlerFailure {
                stage_id,
                reason: format!("no participant registered for target '{}'", target),
            });
        };

        let result = match stage.stage_name {
            StageName::Confirm => participant.confirm(&stage.try_info).await,
            StageName::Cancel => participant.cancel(&stage.try_info).await,
        };

        match result {
            Ok(()) => {
                if handle.complete() {
                    self.compensators
                        .remove(stage.stage_name.as_str(), &stage_id.to_string());
                } else if handle.is_cancelled() {
                    debug!(stage_id = %stage_id, "stage cancelled while executing");
                }
                self.stats.executed.fetch_add(1, Ordering::Relaxed);
                if let Some(ledger) = &self.ledger {
                    ledger.record(stage_id, StageState::Executed);
                }
                debug!(stage_id = %stage_id, stage = %stage.stage_name, target = %target, "stage executed");
                Ok(())
            }
            Err(err) => {
                self.record_failure(stage_id);
                warn!(
                    stage_id = %stage_id,
                    stage = %stage.stage_name,
                    target = %target,
                    error = %err,
                    "stage handler failed"
                );
                Err(TxError::CompensationHandlerFailure {
                    stage_id,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Prevent a queued stage from running.
    ///
    /// Returns false if the stage is executing and finished first. The cancel
    /// only targets `stage_name`; the other stage for the same id still runs.
    pub fn cancel_stage(&self, stage_name: StageName, stage_id: &StageId) -> bool {
        self.compensators
            .cancel(stage_name.as_str(), &stage_id.to_string())
    }

    pub fn compensators(&self) -> &Arc<CompensatorRegistry> {
        &self.compensators
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            executed: self.stats.executed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
        }
    }

    fn record_failure(&self, stage_id: StageId) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(ledger) = &self.ledger {
            ledger.record(stage_id, StageState::Failed);
        }
    }
}

impl Default for TccConsumer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for TccConsumer {
    async fn handle(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        let stage = Stage::decode(self.codec, payload)?;
        debug!(routing_key, stage_id = %stage.stage_id, stage = %stage.stage_name, "stage received");
        self.execute(&stage).await
    }
}
