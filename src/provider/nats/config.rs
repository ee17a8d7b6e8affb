//! NATS connection and stream configuration

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    /// Persist messages to disk
    #[default]
    File,
    /// Keep messages in memory (tests)
    Memory,
}

/// NATS JetStream broker configuration
///
/// The stream plays the role of the durable exchange: it captures every
/// subject under `subject_prefix`. Routing key `K` is published to
/// subject `<subject_prefix>.K`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// JetStream stream name
    pub stream_name: String,

    /// Subject prefix for every routing key
    pub subject_prefix: String,

    /// Storage backend
    pub storage: StorageType,

    /// Maximum message age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Maximum stream size in bytes (-1 = unlimited)
    pub max_bytes: i64,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds (publish acks, consumer creation)
    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            stream_name: "INTEGRATION_EVENTS".to_string(),
            subject_prefix: "integration".to_string(),
            storage: StorageType::File,
            max_age_secs: 0,
            max_bytes: -1,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl NatsConfig {
    /// Defaults overridden by `NATS_URL` / `NATS_TOKEN`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("NATS_URL") {
            config.url = url;
        }
        if let Ok(token) = std::env::var("NATS_TOKEN") {
            config.token = Some(token);
        }
        config
    }

    /// Subject a routing key is published to
    pub fn subject_for(&self, routing_key: &str) -> String {
        format!("{}.{}", self.subject_prefix, routing_key)
    }

    /// Routing key carried by a subject, if it falls under the prefix
    pub fn routing_key_of<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.subject_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|key| !key.is_empty())
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(BusError::Config("NATS url must not be empty".to_string()));
        }
        if self.stream_name.is_empty() || self.stream_name.contains(['.', ' ', '*', '>']) {
            return Err(BusError::Config(format!(
                "Invalid stream name '{}'",
                self.stream_name
            )));
        }
        if self.subject_prefix.is_empty() || self.subject_prefix.ends_with('.') {
            return Err(BusError::Config(format!(
                "Invalid subject prefix '{}'",
                self.subject_prefix
            )));
        }
        Ok(())
    }
}
