use crate::core::StageId;
use crate::transaction::TransactionId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("Lock backend unavailable: {0}")]
    LockUnavailable(String),

    #[error("Timed out after {waited:?} waiting for lock '{key}'")]
    LockTimeout { key: String, waited: Duration },

    #[error("Wait for lock '{0}' was cancelled")]
    LockWaitCancelled(String),

    #[error("Transaction {0} is marked rollback-only and was rolled back")]
    RollbackOnly(TransactionId),

    #[error("Commit of transaction {tx_id} failed in hook: {reason}")]
    CommitHookFailure { tx_id: TransactionId, reason: String },

    #[error("Compensation handler failed for stage {stage_id}: {reason}")]
    CompensationHandlerFailure { stage_id: StageId, reason: String },

    #[error("No active transaction")]
    NoTransaction,

    #[error("Existing transaction {0} found for propagation NEVER")]
    ExistingTransaction(TransactionId),

    #[error("Nested transactions are not supported without savepoints")]
    NestedUnsupported,

    #[error("Illegal transaction state: {0}")]
    IllegalState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TxError {
    /// True for failures a caller may retry (contention-like), false for "give up".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxError::LockTimeout { .. } | TxError::CompensationHandlerFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TxError>;

impl From<serde_json::Error> for TxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TxError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TxError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for TxError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::IllegalState(format!("poisoned lock: {}", err))
    }
}

/// Error type returned by user-supplied hooks and compensation handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
