use crate::lease::LeaseConfig;
use crate::timeout::TimeoutPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Knobs shared by the scheduler and the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Used when a batch does not name its own max try count.
    #[serde(default = "default_max_try_count")]
    pub default_max_try_count: u32,

    /// Delay between provider status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay before the first retry of a transiently failed attempt. Doubles
    /// with every further try, capped at `max_retry_backoff_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub timeouts: TimeoutPolicy,
}

fn default_max_try_count() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

fn default_max_retry_backoff_ms() -> u64 {
    300_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_try_count: default_max_try_count(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            lease: LeaseConfig::default(),
            timeouts: TimeoutPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// How long to hold off after try number `try_count` failed transiently.
    pub fn retry_backoff(&self, try_count: u32) -> Duration {
        let exponent = try_count.saturating_sub(1).min(32);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_retry_backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config: OrchestratorConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.default_max_try_count, 3);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.retry_backoff_ms, 5_000);
    }

    #[test]
    fn retry_backoff_doubles_up_to_the_cap() {
        let config = OrchestratorConfig {
            retry_backoff_ms: 1_000,
            max_retry_backoff_ms: 5_000,
            ..OrchestratorConfig::default()
        };

        assert_eq!(config.retry_backoff(1), Duration::from_secs(1));
        assert_eq!(config.retry_backoff(2), Duration::from_secs(2));
        assert_eq!(config.retry_backoff(3), Duration::from_secs(4));
        assert_eq!(config.retry_backoff(4), Duration::from_secs(5));
        assert_eq!(config.retry_backoff(60), Duration::from_secs(5));
    }
}
