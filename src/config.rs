//! Event bus configuration
//!
//! Read once at service startup, either programmatically via
//! `EventBusConfig::default()` or from a JSON file:
//!
//! ```json
//! {
//!   "subscriptionClientName": "requests",
//!   "retryCount": 10
//! }
//! ```

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Consumer-side and dead-letter settings for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventBusConfig {
    /// Durable queue name for this consuming service
    pub subscription_client_name: String,

    /// Maximum delivery attempts per message before it is dead-lettered
    pub retry_count: u32,

    /// Maximum number of concurrent handler invocations (prefetch)
    pub concurrency: usize,

    /// Upper bound on a single handler invocation
    pub handler_timeout_secs: u64,

    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace_secs: u64,

    /// Redelivery delay requested when a failed message is nacked
    pub retry_delay_ms: u64,

    /// Routing key prefix for dead-lettered messages
    pub dead_letter_prefix: String,

    /// Reconnect backoff
    pub reconnect: BackoffConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscription_client_name: "integration-bus".to_string(),
            retry_count: 10,
            concurrency: 16,
            handler_timeout_secs: 30,
            shutdown_grace_secs: 10,
            retry_delay_ms: 1000,
            dead_letter_prefix: "dead-letter".to_string(),
            reconnect: BackoffConfig::default(),
        }
    }
}

impl EventBusConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            BusError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Parse configuration from a JSON string, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BusError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `EVENTBUS_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(name) = std::env::var("EVENTBUS_SUBSCRIPTION_CLIENT_NAME") {
            self.subscription_client_name = name;
        }
        if let Ok(count) = std::env::var("EVENTBUS_RETRY_COUNT") {
            self.retry_count = count.parse().map_err(|_| {
                BusError::Config(format!("EVENTBUS_RETRY_COUNT is not a number: {}", count))
            })?;
        }
        if let Ok(concurrency) = std::env::var("EVENTBUS_CONCURRENCY") {
            self.concurrency = concurrency.parse().map_err(|_| {
                BusError::Config(format!(
                    "EVENTBUS_CONCURRENCY is not a number: {}",
                    concurrency
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the consumer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.subscription_client_name.trim().is_empty() {
            return Err(BusError::Config(
                "subscriptionClientName must not be empty".to_string(),
            ));
        }
        if self
            .subscription_client_name
            .contains(|c: char| c == '.' || c == '*' || c == '>' || c.is_whitespace())
        {
            return Err(BusError::Config(format!(
                "subscriptionClientName '{}' must be a single token",
                self.subscription_client_name
            )));
        }
        if self.retry_count == 0 {
            return Err(BusError::Config("retryCount must be at least 1".to_string()));
        }
        if self.concurrency == 0 {
            return Err(BusError::Config("concurrency must be at least 1".to_string()));
        }
        if self.handler_timeout_secs == 0 {
            return Err(BusError::Config(
                "handlerTimeoutSecs must be at least 1".to_string(),
            ));
        }
        if self.dead_letter_prefix.trim().is_empty() {
            return Err(BusError::Config(
                "deadLetterPrefix must not be empty".to_string(),
            ));
        }
        // Also names the dead-letter queue, so the same token rules apply
        if self
            .dead_letter_prefix
            .contains(|c: char| c == '.' || c == '*' || c == '>' || c.is_whitespace())
        {
            return Err(BusError::Config(format!(
                "deadLetterPrefix '{}' must be a single token",
                self.dead_letter_prefix
            )));
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Exponential backoff for broker reconnects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    pub base_delay_ms: u64,
    /// Cap for exponential growth
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Delay for a given reconnect attempt (0-indexed)
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp_delay.min(self.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EventBusConfig::default();
        assert_eq!(config.retry_count, 10);
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EventBusConfig::from_json_str(
            r#"{"subscriptionClientName": "requests", "retryCount": 3}"#,
        )
        .unwrap();

        assert_eq!(config.subscription_client_name, "requests");
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.reconnect, BackoffConfig::default());
    }

    #[test]
    fn test_zero_retry_count_rejected() {
        let err = EventBusConfig::from_json_str(r#"{"retryCount": 0}"#).unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn test_dotted_queue_name_rejected() {
        let config = EventBusConfig {
            subscription_client_name: "requests.service".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_dead_letter_prefix_rejected() {
        for prefix in ["dead.letter", "dead-letter.>", "dead letter"] {
            let config = EventBusConfig {
                dead_letter_prefix: prefix.to_string(),
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(BusError::Config(_))),
                "{} should be rejected",
                prefix
            );
        }
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            EventBusConfig::from_json_str("{not json"),
            Err(BusError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("integration-bus-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("eventbus.json");
        std::fs::write(&path, r#"{"subscriptionClientName": "items", "concurrency": 4}"#).unwrap();

        let config = EventBusConfig::from_file(&path).unwrap();
        assert_eq!(config.subscription_client_name, "items");
        assert_eq!(config.concurrency, 4);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_from_missing_file() {
        let result = EventBusConfig::from_file(Path::new("/tmp/nonexistent-eventbus.json"));
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for_attempt(60), Duration::from_millis(1_000));
    }
}
