//! Controller-wide settings, shared read-only by every target worker.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSettings {
    /// Seconds between scheduled cycles of a target.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    /// Concurrent actions per wave.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,

    /// Sync results kept per target.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Seconds a live-state snapshot is reused before listing again.
    #[serde(default = "default_live_cache_ttl_secs")]
    pub live_cache_ttl_secs: u64,
}

fn default_sync_interval() -> u64 {
    180
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_readiness_timeout_secs() -> u64 {
    60
}

fn default_readiness_poll_ms() -> u64 {
    500
}

fn default_history_limit() -> usize {
    50
}

fn default_live_cache_ttl_secs() -> u64 {
    30
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            worker_count: default_worker_count(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            readiness_poll_ms: default_readiness_poll_ms(),
            history_limit: default_history_limit(),
            live_cache_ttl_secs: default_live_cache_ttl_secs(),
        }
    }
}

impl ControllerSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn live_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.live_cache_ttl_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms.max(1))
    }

    /// Delay before retry `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let settings: ControllerSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.sync_interval, 180);
        assert_eq!(settings.worker_count, num_cpus::get());
        assert_eq!(settings.history_limit, 50);
        assert_eq!(settings.live_cache_ttl(), Duration::from_secs(30));
        assert_eq!(settings, ControllerSettings::default());
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let settings = ControllerSettings {
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 3_000,
            ..Default::default()
        };
        assert_eq!(settings.retry_delay(1), Duration::from_millis(500));
        assert_eq!(settings.retry_delay(2), Duration::from_millis(1_000));
        assert_eq!(settings.retry_delay(3), Duration::from_millis(2_000));
        assert_eq!(settings.retry_delay(4), Duration::from_millis(3_000));
        assert_eq!(settings.retry_delay(64), Duration::from_millis(3_000));
    }
}
