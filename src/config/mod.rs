//! Operator configuration.
//!
//! Every external call made during a tick carries one of the timeouts below;
//! [`OperatorConfig::validate`] rejects configurations where any of them is not
//! strictly shorter than the requeue interval, so no call can outlive a tick.

use crate::error::{OperatorError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration shared by every reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Delay before the next tick, on success and on failure.
    #[serde(with = "humantime_serde")]
    pub requeue_interval: Duration,
    /// Bound on a single health probe or topology query.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Bound on a single cluster administration command.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Bound on slot migration (rebalance, drain, fix).
    #[serde(with = "humantime_serde")]
    pub migration_timeout: Duration,
    /// Bound on creating a member and waiting for it to get an address.
    #[serde(with = "humantime_serde")]
    pub member_timeout: Duration,
    /// Consecutive non-OK observations before a node counts as lost.
    pub lost_node_threshold: u32,
    /// Attempts for a blueprint write that keeps hitting conflicts.
    pub conflict_retries: u32,
    /// Attempts for commands that depend on gossip settling (replicate, failover wait).
    pub settle_retries: u32,
    /// Base delay between settle attempts.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(10),
            migration_timeout: Duration::from_secs(25),
            member_timeout: Duration::from_secs(20),
            lost_node_threshold: 2,
            conflict_retries: 3,
            settle_retries: 5,
            settle_delay: Duration::from_millis(500),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OperatorError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            OperatorError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let bounded = [
            ("probe_timeout", self.probe_timeout),
            ("command_timeout", self.command_timeout),
            ("migration_timeout", self.migration_timeout),
            ("member_timeout", self.member_timeout),
        ];
        for (field, timeout) in bounded {
            if timeout.is_zero() {
                return Err(OperatorError::Config(format!("{} must be non-zero", field)));
            }
            if timeout >= self.requeue_interval {
                return Err(OperatorError::Config(format!(
                    "{} ({}ms) must be shorter than requeue_interval ({}ms)",
                    field,
                    timeout.as_millis(),
                    self.requeue_interval.as_millis()
                )));
            }
        }

        if self.lost_node_threshold == 0 {
            return Err(OperatorError::Config(
                "lost_node_threshold must be at least 1".to_string(),
            ));
        }

        if self.conflict_retries == 0 {
            return Err(OperatorError::Config(
                "conflict_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration for tests and local simulation: no waiting.
    pub fn simulation() -> Self {
        Self {
            requeue_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
            migration_timeout: Duration::from_millis(500),
            member_timeout: Duration::from_millis(500),
            settle_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    /// Retry policy for blueprint conflicts.
    pub fn conflict_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.conflict_retries,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Retry policy for commands waiting on cluster gossip.
    pub fn settle_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.settle_retries.max(1),
            initial_delay: self.settle_delay,
            max_delay: self.settle_delay * 4,
            multiplier: 1.5,
            jitter: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
