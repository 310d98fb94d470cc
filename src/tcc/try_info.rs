use crate::core::{Result, StageId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything needed to later Confirm or Cancel one Try invocation.
///
/// Arguments and the Try result are captured as JSON values, so a
/// `TryInfo` never refers to live objects from the Try phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryInfo {
    pub stage_id: StageId,
    /// Logical participant the stage is routed to
    pub target: String,
    /// Method the Try invoked on `target`
    pub method: String,
    pub arguments: Value,
    pub try_result: Value,
    pub captured_at: DateTime<Utc>,
}

impl TryInfo {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            stage_id: StageId::new(),
            target: target.into(),
            method: method.into(),
            arguments: Value::Null,
            try_result: Value::Null,
            captured_at: Utc::now(),
        }
    }

    pub fn with_arguments<T: Serialize>(mut self, arguments: &T) -> Result<Self> {
        self.arguments = serde_json::to_value(arguments)?;
        Ok(self)
    }

    pub fn with_try_result<T: Serialize>(mut self, result: &T) -> Result<Self> {
        self.try_result = serde_json::to_value(result)?;
        Ok(self)
    }

    pub fn arguments_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.arguments.clone())?)
    }

    pub fn try_result_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.try_result.clone())?)
    }
}
