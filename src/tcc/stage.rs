use super::try_info::TryInfo;
use crate::core::{Result, StageId};
use crate::transaction::CompletionOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which follow-up a stage runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Confirm,
    Cancel,
}

impl StageName {
    pub fn from_outcome(outcome: CompletionOutcome) -> Self {
        match outcome {
            CompletionOutcome::Committed => StageName::Confirm,
            CompletionOutcome::RolledBack => StageName::Cancel,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Confirm => "confirm",
            StageName::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage lifecycle as seen by the coordinator (`Executed`/`Failed` are
/// reported by consumers that share the process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageState {
    Captured,
    Dispatched,
    Executed,
    Failed,
}

/// A queued Confirm or Cancel built from a captured `TryInfo`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub stage_id: StageId,
    pub stage_name: StageName,
    pub try_info: TryInfo,
    pub dispatched_at: DateTime<Utc>,
}

impl Stage {
    pub fn new(stage_name: StageName, try_info: TryInfo) -> Self {
        Self {
            stage_id: try_info.stage_id,
            stage_name,
            try_info,
            dispatched_at: Utc::now(),
        }
    }

    pub fn encode(&self, codec: PayloadCodec) -> Result<Vec<u8>> {
        codec.encode(self)
    }

    pub fn decode(codec: PayloadCodec, payload: &[u8]) -> Result<Self> {
        codec.decode(payload)
    }
}

/// Wire encoding of stage payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadCodec {
    #[default]
    Json,
    MessagePack,
}

impl PayloadCodec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            PayloadCodec::Json => Ok(serde_json::to_vec(value)?),
            PayloadCodec::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        match self {
            PayloadCodec::Json => Ok(serde_json::from_slice(payload)?),
            PayloadCodec::MessagePack => Ok(rmp_serde::from_slice(payload)?),
        }
    }
}
