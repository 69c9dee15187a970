use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Workflow-level configuration recognized by the engine.
///
/// Per-task settings (`retry_count`, `timeout_ms` on a
/// [`TaskSpec`](crate::engine::TaskSpec)) take precedence over the defaults
/// here.
#[derive(Clone, Debug)]
pub struct WorkflowConfig {
    /// Cap on loop-pattern iterations in the agent graph.
    pub max_iterations: u32,
    /// Default retry count when a task does not specify one.
    pub max_retries: u32,
    /// Default per-task timeout. `None` disables the timeout race.
    pub timeout_ms: Option<u64>,
    /// Backoff seed between attempts. Zero disables sleeping.
    pub retry_delay_ms: u64,
    /// Backoff growth factor between attempts.
    pub retry_delay_multiplier: f64,
    /// External cancellation hook, threaded to every task and IO call.
    pub cancel: CancellationToken,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_retries: 0,
            timeout_ms: None,
            retry_delay_ms: 0,
            retry_delay_multiplier: 2.0,
            cancel: CancellationToken::new(),
        }
    }
}

impl WorkflowConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, seed_ms: u64, multiplier: f64) -> Self {
        self.retry_delay_ms = seed_ms;
        self.retry_delay_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Backoff before attempt `failed_attempts + 1`:
    /// `retry_delay_ms × retry_delay_multiplier^(failed_attempts − 1)`.
    #[must_use]
    pub fn retry_delay(&self, failed_attempts: u32) -> Duration {
        if self.retry_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = failed_attempts.saturating_sub(1) as i32;
        let delay = self.retry_delay_ms as f64 * self.retry_delay_multiplier.powi(exponent);
        Duration::from_millis(delay as u64)
    }
}

/// The serializable subset of [`WorkflowConfig`] stored in snapshots.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfigSnapshot {
    pub max_iterations: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub retry_delay_ms: u64,
    pub retry_delay_multiplier: f64,
}

impl From<&WorkflowConfig> for WorkflowConfigSnapshot {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_retries: config.max_retries,
            timeout_ms: config.timeout_ms,
            retry_delay_ms: config.retry_delay_ms,
            retry_delay_multiplier: config.retry_delay_multiplier,
        }
    }
}

impl WorkflowConfigSnapshot {
    /// Rebuild a runtime config from the persisted form, with a fresh
    /// cancellation token.
    #[must_use]
    pub fn into_config(self) -> WorkflowConfig {
        WorkflowConfig {
            max_iterations: self.max_iterations,
            max_retries: self.max_retries,
            timeout_ms: self.timeout_ms,
            retry_delay_ms: self.retry_delay_ms,
            retry_delay_multiplier: self.retry_delay_multiplier,
            cancel: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_exponentially() {
        let config = WorkflowConfig::default().with_retry_delay(100, 2.0);
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn zero_seed_disables_backoff() {
        let config = WorkflowConfig::default();
        assert_eq!(config.retry_delay(5), Duration::ZERO);
    }

    #[test]
    fn snapshot_roundtrip() {
        let config = WorkflowConfig::default()
            .with_max_retries(3)
            .with_timeout_ms(5_000)
            .with_retry_delay(250, 1.5);
        let snapshot = WorkflowConfigSnapshot::from(&config);
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: WorkflowConfigSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
        let rebuilt = parsed.into_config();
        assert_eq!(rebuilt.max_retries, 3);
        assert_eq!(rebuilt.timeout_ms, Some(5_000));
    }
}
