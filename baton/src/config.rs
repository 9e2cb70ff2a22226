use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BatonError, Result};

/// Top-level coordinator configuration.
///
/// Every section is `#[serde(default)]`, so a JSON document only needs the
/// fields it wants to override.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub balancer: BalancerWeights,
    pub autoscaler: AutoScalerConfig,
    pub retention: RetentionConfig,
    pub submission: SubmissionConfig,
    /// Buffered events per subscriber before it starts lagging.
    pub event_bus_capacity: usize,
    /// Batch size used when scanning the store.
    pub page_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            balancer: BalancerWeights::default(),
            autoscaler: AutoScalerConfig::default(),
            retention: RetentionConfig::default(),
            submission: SubmissionConfig::default(),
            event_bus_capacity: 1024,
            page_size: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            anyhow::anyhow!("reading config {}: {err}", path.display())
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BatonError::InvalidSubmission(msg.into()));

        if self.retry.default_max_attempts == 0 {
            return invalid("retry.default_max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_backoff_ms {
            return invalid("retry.base_delay_ms exceeds retry.max_backoff_ms");
        }
        if self.health.heartbeat_timeout_ms == 0 {
            return invalid("health.heartbeat_timeout_ms must be positive");
        }
        if self.autoscaler.min_nodes > self.autoscaler.max_nodes {
            return invalid("autoscaler.min_nodes exceeds autoscaler.max_nodes");
        }
        if self.autoscaler.low_water >= self.autoscaler.high_water {
            return invalid("autoscaler.low_water must be below high_water");
        }
        let b = &self.balancer;
        let weights = [b.load, b.capability_match, b.success_rate];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return invalid("balancer weights must be finite and non-negative");
        }
        if !(0.0..=1.0).contains(&b.failure_penalty) {
            return invalid("balancer.failure_penalty must be within [0, 1]");
        }
        if self.event_bus_capacity == 0 || self.page_size == 0 {
            return invalid("event_bus_capacity and page_size must be positive");
        }
        if self.submission.max_batch_size == 0 {
            return invalid("submission.max_batch_size must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound between scheduling passes when nothing wakes the loop.
    pub pass_interval_ms: u64,
    pub max_dispatch_per_pass: usize,
    /// How often failed jobs with an elapsed backoff are re-queued.
    pub retry_poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pass_interval_ms: 500,
            max_dispatch_per_pass: 64,
            retry_poll_interval_ms: 250,
        }
    }
}

impl SchedulerConfig {
    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.retry_poll_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub default_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_backoff_ms: 300_000, // 5 minutes
            default_max_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub heartbeat_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 15_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(
            i64::try_from(self.heartbeat_timeout_ms).unwrap_or(i64::MAX),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Load balancer scoring weights.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerWeights {
    pub load: f64,
    pub capability_match: f64,
    pub success_rate: f64,
    /// Outcomes remembered per (node, job class).
    pub success_window: usize,
    /// Recent failure rate above which a node is penalised.
    pub failure_penalty_threshold: f64,
    /// Fraction of the score removed from a penalised node.
    pub failure_penalty: f64,
}

impl Default for BalancerWeights {
    fn default() -> Self {
        Self {
            load: 0.5,
            capability_match: 0.3,
            success_rate: 0.2,
            success_window: 20,
            failure_penalty_threshold: 0.5,
            failure_penalty: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalerConfig {
    pub interval_ms: u64,
    pub high_water: f64,
    pub low_water: f64,
    pub sustained_low_ms: u64,
    pub cooldown_ms: u64,
    pub min_nodes: usize,
    pub max_nodes: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            high_water: 1.5,
            low_water: 0.25,
            sustained_low_ms: 60_000,
            cooldown_ms: 120_000,
            min_nodes: 1,
            max_nodes: 16,
        }
    }
}

impl AutoScalerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(
            i64::try_from(self.cooldown_ms).unwrap_or(i64::MAX),
        )
    }

    pub fn sustained_low(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(
            i64::try_from(self.sustained_low_ms).unwrap_or(i64::MAX),
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_secs: u64,
    pub purge_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_secs: 86_400,
            purge_interval_ms: 60_000,
        }
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.retention_secs).unwrap_or(i64::MAX / 1000),
        )
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Jobs accepted per minute; 0 disables throttling.
    pub rate_limit_per_minute: u32,
    pub default_timeout_secs: u64,
    pub max_batch_size: usize,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 60,
            default_timeout_secs: 3600,
            max_batch_size: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.health.heartbeat_timeout_ms, 15_000);
        assert_eq!(config.submission.rate_limit_per_minute, 60);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CoordinatorConfig::from_json_str(
            r#"{ "retry": { "default_max_attempts": 5 }, "page_size": 10 }"#,
        )
        .unwrap();
        assert_eq!(config.retry.default_max_attempts, 5);
        assert_eq!(config.retry.max_backoff_ms, 300_000);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.autoscaler.max_nodes, 16);
    }

    #[test]
    fn test_validation_rejects_inverted_watermarks() {
        let err = CoordinatorConfig::from_json_str(
            r#"{ "autoscaler": { "low_water": 2.0, "high_water": 1.0 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, BatonError::InvalidSubmission(_)));
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = CoordinatorConfig::default();
        config.retry.default_max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baton.json");
        std::fs::write(&path, r#"{ "health": { "heartbeat_timeout_ms": 500 } }"#)
            .unwrap();

        let config = CoordinatorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.health.heartbeat_timeout_ms, 500);
        assert_eq!(config.health.heartbeat_timeout().num_milliseconds(), 500);
    }
}
