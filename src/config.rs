use crate::core::{DiscoveryError, Result};
use crate::transaction::TransactionPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Discovery engine configuration
///
/// Durations are stored as milliseconds so the JSON file stays plain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Recurring poll interval per service
    pub discovery_interval_ms: u64,

    pub deep_discovery_enabled: bool,

    /// Deep discovery trigger interval
    pub deep_discovery_interval_ms: u64,

    /// Honor cancellation requests at graph-build checkpoints
    pub cancellation_enabled: bool,

    /// Retry and timeout policy of the mapping transaction
    pub transaction: TransactionPolicy,

    /// Consecutive failed root fetches that confirm a failure
    pub verification_attempts: u32,

    pub verification_retry_delay_ms: u64,

    /// How often unreachable services are probed for recovery
    pub unreachable_check_interval_ms: u64,

    /// Grace period before an unreachable service is evicted
    pub service_removal_delay_ms: u64,

    pub removal_check_interval_ms: u64,

    pub subscription_renewal_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 60_000,
            deep_discovery_enabled: false,
            deep_discovery_interval_ms: 10_000,
            cancellation_enabled: true,
            transaction: TransactionPolicy::default(),
            verification_attempts: 3,
            verification_retry_delay_ms: 1_000,
            unreachable_check_interval_ms: 30_000,
            service_removal_delay_ms: 3_600_000,
            removal_check_interval_ms: 60_000,
            subscription_renewal_interval_ms: 600_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            DiscoveryError::Configuration(format!("cannot read {}: {}", path.display(), err))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("deep_discovery_interval_ms", self.deep_discovery_interval_ms),
            ("unreachable_check_interval_ms", self.unreachable_check_interval_ms),
            ("removal_check_interval_ms", self.removal_check_interval_ms),
            ("subscription_renewal_interval_ms", self.subscription_renewal_interval_ms),
            ("transaction.timeout_ms", self.transaction.timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(DiscoveryError::Configuration(format!("{name} must be positive")));
        }
        if self.verification_attempts == 0 {
            return Err(DiscoveryError::Configuration(
                "verification_attempts must be positive".into(),
            ));
        }
        if self.transaction.max_attempts == 0 {
            return Err(DiscoveryError::Configuration(
                "transaction.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval_ms = duration_ms(interval);
        self
    }

    pub fn deep_discovery(mut self, enabled: bool, interval: Duration) -> Self {
        self.deep_discovery_enabled = enabled;
        self.deep_discovery_interval_ms = duration_ms(interval);
        self
    }

    pub fn cancellation(mut self, enabled: bool) -> Self {
        self.cancellation_enabled = enabled;
        self
    }

    pub fn transaction_policy(mut self, policy: TransactionPolicy) -> Self {
        self.transaction = policy;
        self
    }

    pub fn verification(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.verification_attempts = attempts;
        self.verification_retry_delay_ms = duration_ms(retry_delay);
        self
    }

    pub fn unreachable_check_interval(mut self, interval: Duration) -> Self {
        self.unreachable_check_interval_ms = duration_ms(interval);
        self
    }

    pub fn service_removal(mut self, delay: Duration, check_interval: Duration) -> Self {
        self.service_removal_delay_ms = duration_ms(delay);
        self.removal_check_interval_ms = duration_ms(check_interval);
        self
    }

    pub fn subscription_renewal_interval(mut self, interval: Duration) -> Self {
        self.subscription_renewal_interval_ms = duration_ms(interval);
        self
    }

    pub fn discovery_interval_duration(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn deep_discovery_interval_duration(&self) -> Duration {
        Duration::from_millis(self.deep_discovery_interval_ms)
    }

    pub fn verification_retry_delay(&self) -> Duration {
        Duration::from_millis(self.verification_retry_delay_ms)
    }

    pub fn unreachable_check_interval_duration(&self) -> Duration {
        Duration::from_millis(self.unreachable_check_interval_ms)
    }

    pub fn service_removal_delay(&self) -> Duration {
        Duration::from_millis(self.service_removal_delay_ms)
    }

    pub fn removal_check_interval(&self) -> Duration {
        Duration::from_millis(self.removal_check_interval_ms)
    }

    pub fn subscription_renewal_interval_duration(&self) -> Duration {
        Duration::from_millis(self.subscription_renewal_interval_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
