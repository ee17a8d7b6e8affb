//! Error types for the integration bus

use thiserror::Error;

/// Errors that can occur on the integration bus
#[derive(Debug, Error)]
pub enum BusError {
    /// Broker connection failure or connection lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish event with routing key '{routing_key}': {reason}")]
    Publish {
        routing_key: String,
        reason: String,
    },

    /// Queue declaration or binding failure
    #[error("Failed to subscribe queue '{queue}': {reason}")]
    Subscribe {
        queue: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream/exchange creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer creation or delivery error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A handler is already registered for the routing key
    #[error("A handler is already registered for event type '{0}'")]
    DuplicateHandler(String),

    /// Broker is unreachable
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

impl BusError {
    /// Whether the error is a broker connectivity problem that a
    /// reconnect can recover from
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Connection(_) | BusError::Unavailable(_) | BusError::Timeout(_)
        )
    }
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BusError::Connection("reset".into()).is_transient());
        assert!(BusError::Unavailable("down".into()).is_transient());
        assert!(BusError::Timeout("ack".into()).is_transient());
        assert!(!BusError::DuplicateHandler("X".into()).is_transient());
        assert!(!BusError::Config("bad".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = BusError::Publish {
            routing_key: "UserCreatedIntegrationEvent".into(),
            reason: "broker down".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to publish event with routing key 'UserCreatedIntegrationEvent': broker down"
        );
    }
}
