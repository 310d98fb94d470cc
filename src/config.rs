use crate::core::{Result, TxError};
use crate::tcc::PayloadCodec;
use crate::transaction::{NestedFallback, Propagation, TransactionDefinition};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for transactions, locks and TCC dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Propagation used when a call site declares none
    pub default_propagation: Propagation,

    /// Whether the backing store can take savepoints (enables real NESTED)
    pub nested_savepoints: bool,

    /// NESTED behaviour when savepoints are unavailable
    pub nested_fallback: NestedFallback,

    /// Default lock lease
    pub lock_lease_ms: u64,

    /// Renewal period as a fraction of the lease
    pub lock_renewal_ratio: f64,

    /// Absolute renewal period; overrides `lock_renewal_ratio`
    pub lock_renewal_interval_ms: Option<u64>,

    /// Fixed sleep between acquisition attempts in `lock_wait`
    pub lock_poll_interval_ms: u64,

    /// Default timeout for `lock_wait`
    pub lock_wait_timeout_ms: u64,

    /// Suffix of the per-key fencing counter
    pub lock_fence_suffix: String,

    /// Prefix of TCC routing keys (`{prefix}.{target}`)
    pub tcc_routing_prefix: String,

    /// Encoding of stage payloads
    pub tcc_payload_codec: PayloadCodec,

    /// Number of stage states remembered for inspection
    pub tcc_ledger_capacity: usize,

    /// Delay before the in-memory transport redelivers a failed message
    pub transport_redelivery_delay_ms: u64,

    /// Deliveries per message before it is dead-lettered
    pub transport_max_deliveries: u32,
}

impl TxConfig {
    pub fn new() -> Self {
        Self {
            default_propagation: Propagation::Required,
            nested_savepoints: true,
            nested_fallback: NestedFallback::Required,
            lock_lease_ms: 30_000,
            lock_renewal_ratio: 0.5,
            lock_renewal_interval_ms: None,
            lock_poll_interval_ms: 100,
            lock_wait_timeout_ms: 10_000,
            lock_fence_suffix: ":fence".to_string(),
            tcc_routing_prefix: "tcc".to_string(),
            tcc_payload_codec: PayloadCodec::Json,
            tcc_ledger_capacity: 4096,
            transport_redelivery_delay_ms: 500,
            transport_max_deliveries: 10,
        }
    }

    pub fn default_propagation(mut self, propagation: Propagation) -> Self {
        self.default_propagation = propagation;
        self
    }

    pub fn nested_savepoints(mut self, enabled: bool) -> Self {
        self.nested_savepoints = enabled;
        self
    }

    pub fn nested_fallback(mut self, fallback: NestedFallback) -> Self {
        self.nested_fallback = fallback;
        self
    }

    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease_ms = lease.as_millis() as u64;
        self
    }

    pub fn lock_renewal_ratio(mut self, ratio: f64) -> Self {
        self.lock_renewal_ratio = ratio;
        self
    }

    pub fn lock_renewal_interval(mut self, interval: Duration) -> Self {
        self.lock_renewal_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn tcc_routing_prefix(mut self, prefix: &str) -> Self {
        self.tcc_routing_prefix = prefix.to_string();
        self
    }

    pub fn tcc_payload_codec(mut self, codec: PayloadCodec) -> Self {
        self.tcc_payload_codec = codec;
        self
    }

    pub fn transport_redelivery_delay(mut self, delay: Duration) -> Self {
        self.transport_redelivery_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn transport_max_deliveries(mut self, max: u32) -> Self {
        self.transport_max_deliveries = max;
        self
    }

    /// Definition applied to call sites that declare none
    pub fn default_definition(&self) -> TransactionDefinition {
        TransactionDefinition::new(self.default_propagation)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.transport_redelivery_delay_ms)
    }

    /// Renewal period for a given lease.
    ///
    /// A fixed `lock_renewal_interval_ms` never exceeds `lease * lock_renewal_ratio`,
    /// so short per-call leases are still renewed in time.
    pub fn renewal_period(&self, lease: Duration) -> Duration {
        let by_ratio = lease.mul_f64(self.lock_renewal_ratio);
        let period = match self.lock_renewal_interval_ms {
            Some(ms) => Duration::from_millis(ms).min(by_ratio),
            None => by_ratio,
        };
        period.max(Duration::from_millis(1))
    }

    /// Parse from JSON; missing fields keep their defaults
    ///
    /// # Examples
    ///
    /// ```
    /// use txweave::TxConfig;
    ///
    /// let config = TxConfig::from_json_str(r#"{"lock_lease_ms": 2000}"#).unwrap();
    /// assert_eq!(config.lock_lease_ms, 2000);
    /// assert_eq!(config.tcc_routing_prefix, "tcc");
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TxConfig =
            serde_json::from_str(json).map_err(|e| TxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.lock_lease_ms == 0 {
            return Err(TxError::Config("lock_lease_ms must be > 0".into()));
        }

        if !(self.lock_renewal_ratio > 0.0 && self.lock_renewal_ratio < 1.0) {
            return Err(TxError::Config(
                "lock_renewal_ratio must be between 0 and 1 (exclusive)".into(),
            ));
        }

        if let Some(interval) = self.lock_renewal_interval_ms {
            if interval == 0 || interval >= self.lock_lease_ms {
                return Err(TxError::Config(
                    "lock_renewal_interval_ms must be > 0 and shorter than the lease".into(),
                ));
            }
        }

        if self.lock_poll_interval_ms == 0 {
            return Err(TxError::Config("lock_poll_interval_ms must be > 0".into()));
        }

        if self.tcc_routing_prefix.trim().is_empty() {
            return Err(TxError::Config("tcc_routing_prefix cannot be empty".into()));
        }

        if self.tcc_ledger_capacity == 0 {
            return Err(TxError::Config("tcc_ledger_capacity must be > 0".into()));
        }

        if self.transport_max_deliveries == 0 {
            return Err(TxError::Config("transport_max_deliveries must be > 0".into()));
        }

        Ok(())
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        Self::new()
    }
}
