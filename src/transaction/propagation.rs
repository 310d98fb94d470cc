use serde::{Deserialize, Serialize};

/// Policy governing whether a call joins, suspends or ignores an active transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Join the current transaction, or create one
    #[default]
    Required,

    /// Always create a new transaction, suspending the current one
    RequiresNew,

    /// Savepoint-style child of the current transaction
    Nested,

    /// Join if active, otherwise run without a managed transaction
    Supports,

    /// Join the current transaction; fail if there is none
    Mandatory,

    /// Run without a transaction; fail if one is active
    Never,

    /// Suspend the current transaction and run without one
    NotSupported,
}

impl std::fmt::Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Propagation::Required => "REQUIRED",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Nested => "NESTED",
            Propagation::Supports => "SUPPORTS",
            Propagation::Mandatory => "MANDATORY",
            Propagation::Never => "NEVER",
            Propagation::NotSupported => "NOT_SUPPORTED",
        };
        f.write_str(name)
    }
}

/// What NESTED does when the backing store cannot take savepoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedFallback {
    /// Join the current transaction as REQUIRED would (logged at warn)
    #[default]
    Required,

    /// Refuse with `TxError::NestedUnsupported`
    Reject,
}

/// Declared transaction attributes of a guarded call site
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub name: Option<String>,
}

impl TransactionDefinition {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            name: None,
        }
    }

    pub fn required() -> Self {
        Self::new(Propagation::Required)
    }

    pub fn requires_new() -> Self {
        Self::new(Propagation::RequiresNew)
    }

    pub fn nested() -> Self {
        Self::new(Propagation::Nested)
    }

    pub fn supports() -> Self {
        Self::new(Propagation::Supports)
    }

    /// Attach a name used in log output
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
