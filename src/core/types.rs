use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a captured Try phase and of the Confirm/Cancel stage built from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub Uuid);

impl StageId {
    pub fn new() -> Self {
        StageId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage_{}", self.0)
    }
}

/// Opaque value stored under a lock key; unique per acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        OwnerToken(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerToken {
    fn from(value: &str) -> Self {
        OwnerToken(value.to_string())
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        OwnerToken(value)
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
