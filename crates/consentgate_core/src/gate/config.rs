use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gate::core::{fatigue::FatiguePolicy, record::DEFAULT_LIFETIME_MONTHS};

/// Tunables for the consent gate.
///
/// Every field has a default, so a partial JSON document is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GateConfig {
    /// Slot holding the consent envelope.
    pub storage_key: String,
    /// Slot holding the banner prompt history.
    pub history_key: String,
    /// Slot holding the persisted audit trail.
    pub audit_key: String,
    /// Policy version stamped into new records.
    pub policy_version: String,
    pub consent_lifetime_months: u32,
    pub rate_limit_max_updates: u32,
    pub rate_limit_window_secs: u64,
    pub health_check_delay_ms: u64,
    pub dependency_recheck_interval_ms: u64,
    pub max_dependency_rechecks: u32,
    pub fatigue_base_delay_secs: u64,
    pub fatigue_max_delay_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            storage_key: "consentgate:consent".to_string(),
            history_key: "consentgate:prompt-history".to_string(),
            audit_key: "consentgate:audit".to_string(),
            policy_version: "1.0".to_string(),
            consent_lifetime_months: DEFAULT_LIFETIME_MONTHS,
            rate_limit_max_updates: 10,
            rate_limit_window_secs: 60 * 60,
            health_check_delay_ms: 5_000,
            dependency_recheck_interval_ms: 500,
            max_dependency_rechecks: 20,
            fatigue_base_delay_secs: 24 * 60 * 60,
            fatigue_max_delay_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl GateConfig {
    pub fn with_policy_version(self, policy_version: &str) -> Self {
        Self { policy_version: policy_version.to_string(), ..self }
    }

    pub fn with_rate_limit(self, max_updates: u32, window: Duration) -> Self {
        Self { rate_limit_max_updates: max_updates, rate_limit_window_secs: window.as_secs(), ..self }
    }

    pub fn with_health_check_delay(self, delay: Duration) -> Self {
        Self { health_check_delay_ms: delay.as_millis() as u64, ..self }
    }

    pub fn with_dependency_recheck(self, interval: Duration, max_rechecks: u32) -> Self {
        Self {
            dependency_recheck_interval_ms: interval.as_millis() as u64,
            max_dependency_rechecks: max_rechecks,
            ..self
        }
    }

    pub fn with_fatigue(self, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            fatigue_base_delay_secs: base_delay.as_secs(),
            fatigue_max_delay_secs: max_delay.as_secs(),
            ..self
        }
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn health_check_delay(&self) -> Duration {
        Duration::from_millis(self.health_check_delay_ms)
    }

    pub fn dependency_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.dependency_recheck_interval_ms)
    }

    pub fn fatigue_policy(&self) -> FatiguePolicy {
        FatiguePolicy::new(
            Duration::from_secs(self.fatigue_base_delay_secs),
            Duration::from_secs(self.fatigue_max_delay_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_config_partial_json_uses_defaults() {
        let config: GateConfig =
            serde_json::from_str(r#"{ "policyVersion": "2.0", "rateLimitMaxUpdates": 3 }"#).unwrap();
        assert_eq!(config.policy_version, "2.0");
        assert_eq!(config.rate_limit_max_updates, 3);
        assert_eq!(config.storage_key, GateConfig::default().storage_key);
        assert_eq!(config.rate_limit_window(), Duration::from_secs(3600));
    }
}
