//! Engine tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Settings for a [`TaskEngine`](crate::engine::TaskEngine).
///
/// Loaded as the `[engine]` table of the control-plane configuration;
/// every field has a default.
///
/// ```toml
/// default_task_ttl_ms = 86400000
/// await_poll_interval_ms = 25
///
/// [retry]
/// max_attempts = 5
/// delay_ms = 2000
/// ```
///
/// # Examples
///
/// ```
/// use armada_tasks::config::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.retry.max_attempts, 3);
/// assert_eq!(config.default_task_ttl_ms, None);
/// assert_eq!(config.event_capacity, 256);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default policy handed to stage handlers for remote calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Expiry applied to tasks started without one. `None` means tasks
    /// never expire unless the request says so.
    #[serde(default)]
    pub default_task_ttl_ms: Option<u64>,

    /// Store polling period of `await_terminal`.
    #[serde(default = "default_await_poll_interval")]
    pub await_poll_interval_ms: u64,

    /// Buffer of the task event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_await_poll_interval() -> u64 {
    25
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_task_ttl_ms: None,
            await_poll_interval_ms: default_await_poll_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_task_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.default_task_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn await_poll_interval(&self) -> Duration {
        Duration::from_millis(self.await_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"retry": {"max_attempts": 7}}"#).unwrap();
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.delay_ms, 1_000);
        assert_eq!(config.await_poll_interval_ms, 25);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = EngineConfig {
            await_poll_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.await_poll_interval(), Duration::from_millis(1));
    }
}
