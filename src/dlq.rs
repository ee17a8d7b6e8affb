//! Dead Letter Queue: park messages that cannot be processed
//!
//! A message is dead-lettered when its handler keeps failing after the
//! configured number of delivery attempts, or immediately when it can
//! never succeed (no handler for its routing key, undecodable payload).
//! The consumer acknowledges the original only after the `DlqHandler`
//! has accepted it, so a message is never dropped on the floor.

use crate::error::Result;
use crate::provider::{Broker, ConsumerBinding};
use crate::types::{OutgoingMessage, ReceivedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Unacknowledged deliveries allowed to whoever drains a dead-letter queue
const DEAD_LETTER_PREFETCH: usize = 100;

/// Settlement wait for dead-letter queue consumers
const DEAD_LETTER_ACK_WAIT: Duration = Duration::from_secs(60);

/// Header carrying the dead-letter reason on republished messages
pub const DEAD_LETTER_REASON_HEADER: &str = "X-Dead-Letter-Reason";

/// Header carrying the routing key the message was originally published under
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "X-Original-Routing-Key";

/// Header carrying the delivery count at the time of dead-lettering
pub const DELIVERY_COUNT_HEADER: &str = "X-Delivery-Count";

/// Why a message was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The handler failed on every allowed attempt
    AttemptsExhausted { attempts: u64, last_error: String },
    /// No handler is registered for the routing key
    UnknownEventType,
    /// The payload does not decode into the registered event type
    MalformedPayload(String),
}

impl DeadLetterReason {
    /// Producer/consumer mismatch that no amount of redelivery fixes
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, DeadLetterReason::AttemptsExhausted { .. })
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::AttemptsExhausted {
                attempts,
                last_error,
            } => write!(f, "failed after {} attempts: {}", attempts, last_error),
            DeadLetterReason::UnknownEventType => write!(f, "no handler registered"),
            DeadLetterReason::MalformedPayload(e) => write!(f, "malformed payload: {}", e),
        }
    }
}

/// A dead-lettered message with context about why it ended up here
#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    /// The original delivery
    pub message: ReceivedMessage,

    /// Reason the message was dead-lettered
    pub reason: DeadLetterReason,

    /// When the message was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn new(message: ReceivedMessage, reason: DeadLetterReason) -> Self {
        Self {
            message,
            reason,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Trait for dead letter destinations
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Accept a dead-lettered message
    ///
    /// An error keeps the original message unacknowledged so that it is
    /// offered to the dead-letter path again on its next delivery.
    async fn handle(&self, event: DeadLetterEvent) -> Result<()>;

    /// Number of events this handler has accepted and still retains
    async fn count(&self) -> Result<usize>;

    /// Recent dead-lettered events, most recent first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>>;
}

/// In-memory DLQ handler for development and testing
///
/// Stores dead-lettered events in a `Vec` with configurable max capacity.
pub struct MemoryDlqHandler {
    events: Arc<RwLock<Vec<DeadLetterEvent>>>,
    max_events: usize,
}

impl MemoryDlqHandler {
    /// Create a new in-memory DLQ handler
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        let mut events = self.events.write().await;
        events.push(event);

        if self.max_events > 0 && events.len() > self.max_events {
            let drain_count = events.len() - self.max_events;
            events.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let events = self.events.read().await;
        Ok(events.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

/// Republishes dead-lettered messages to the broker
///
/// The original body is published unchanged under
/// `<prefix>.<original routing key>` with the reason, original routing
/// key and delivery count as headers. Before publishing, that key is
/// bound to the durable queue `<source queue>-<prefix>`, so the parked
/// message is held by the broker rather than routed nowhere. A bounded
/// record of recent dead-letters is kept locally for inspection.
pub struct BrokerDlqHandler {
    broker: Arc<dyn Broker>,
    prefix: String,
    recent: MemoryDlqHandler,
}

impl BrokerDlqHandler {
    pub fn new(broker: Arc<dyn Broker>, prefix: impl Into<String>) -> Self {
        Self {
            broker,
            prefix: prefix.into(),
            recent: MemoryDlqHandler::new(1_000),
        }
    }

    /// Routing key a dead-lettered message is republished under
    pub fn dead_letter_key(&self, routing_key: &str) -> String {
        format!("{}.{}", self.prefix, routing_key)
    }

    /// Durable queue holding messages dead-lettered from `source_queue`
    pub fn dead_letter_queue(&self, source_queue: &str) -> String {
        format!("{}-{}", source_queue, self.prefix)
    }
}

#[async_trait]
impl DlqHandler for BrokerDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        let mut headers: HashMap<String, String> = event.message.headers.clone();
        headers.insert(DEAD_LETTER_REASON_HEADER.to_string(), event.reason.to_string());
        headers.insert(
            ORIGINAL_ROUTING_KEY_HEADER.to_string(),
            event.message.routing_key.clone(),
        );
        headers.insert(
            DELIVERY_COUNT_HEADER.to_string(),
            event.message.num_delivered.to_string(),
        );

        let routing_key = self.dead_letter_key(&event.message.routing_key);
        self.broker
            .declare(&ConsumerBinding {
                queue: self.dead_letter_queue(&event.message.queue),
                routing_keys: vec![routing_key.clone()],
                prefetch: DEAD_LETTER_PREFETCH,
                ack_wait: DEAD_LETTER_ACK_WAIT,
            })
            .await?;

        let message = OutgoingMessage {
            routing_key,
            body: event.message.body.clone(),
            message_id: None,
            headers,
        };

        self.broker.publish(&message).await?;
        self.recent.handle(event).await
    }

    async fn count(&self) -> Result<usize> {
        self.recent.count().await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        self.recent.list(limit).await
    }
}

/// Whether a failed delivery has used up its attempt budget
pub fn should_dead_letter(message: &ReceivedMessage, max_attempts: u32) -> bool {
    message.num_delivered >= u64::from(max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{MemoryBroker, MemoryConfig};
    use bytes::Bytes;

    fn test_message(num_delivered: u64) -> ReceivedMessage {
        ReceivedMessage {
            routing_key: "UserCreatedIntegrationEvent".to_string(),
            body: Bytes::from_static(b"{\"payload\":{}}"),
            num_delivered,
            sequence: 1,
            queue: "requests".to_string(),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_should_dead_letter() {
        assert!(!should_dead_letter(&test_message(1), 5));
        assert!(!should_dead_letter(&test_message(4), 5));
        assert!(should_dead_letter(&test_message(5), 5));
        assert!(should_dead_letter(&test_message(10), 5));
    }

    #[test]
    fn test_single_attempt_budget() {
        assert!(should_dead_letter(&test_message(1), 1));
    }

    #[test]
    fn test_reason_classification() {
        assert!(DeadLetterReason::UnknownEventType.is_configuration_error());
        assert!(DeadLetterReason::MalformedPayload("eof".into()).is_configuration_error());
        assert!(!DeadLetterReason::AttemptsExhausted {
            attempts: 10,
            last_error: "db down".into()
        }
        .is_configuration_error());
    }

    #[test]
    fn test_reason_display() {
        let reason = DeadLetterReason::AttemptsExhausted {
            attempts: 3,
            last_error: "boom".into(),
        };
        assert_eq!(reason.to_string(), "failed after 3 attempts: boom");
    }

    #[tokio::test]
    async fn test_memory_dlq_handle_and_count() {
        let dlq = MemoryDlqHandler::default();
        assert_eq!(dlq.count().await.unwrap(), 0);

        dlq.handle(DeadLetterEvent::new(
            test_message(5),
            DeadLetterReason::UnknownEventType,
        ))
        .await
        .unwrap();

        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_dlq_list_most_recent_first() {
        let dlq = MemoryDlqHandler::default();

        for i in 0..5 {
            let mut message = test_message(3);
            message.sequence = i;
            dlq.handle(DeadLetterEvent::new(
                message,
                DeadLetterReason::MalformedPayload(format!("reason {}", i)),
            ))
            .await
            .unwrap();
        }

        let list = dlq.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].message.sequence, 4);
        assert_eq!(list[2].message.sequence, 2);
    }

    #[tokio::test]
    async fn test_memory_dlq_max_capacity() {
        let dlq = MemoryDlqHandler::new(3);

        for i in 0..5 {
            let mut message = test_message(1);
            message.sequence = i;
            dlq.handle(DeadLetterEvent::new(message, DeadLetterReason::UnknownEventType))
                .await
                .unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 3);
        let list = dlq.list(10).await.unwrap();
        assert_eq!(list[0].message.sequence, 4);
        assert_eq!(list[2].message.sequence, 2);
    }

    #[tokio::test]
    async fn test_broker_dlq_republishes_with_headers() {
        let broker = MemoryBroker::new(MemoryConfig { max_published: 0 });
        let dlq = BrokerDlqHandler::new(Arc::new(broker.clone()), "dead-letter");
        assert_eq!(dlq.dead_letter_queue("requests"), "requests-dead-letter");

        dlq.handle(DeadLetterEvent::new(
            test_message(10),
            DeadLetterReason::AttemptsExhausted {
                attempts: 10,
                last_error: "db down".into(),
            },
        ))
        .await
        .unwrap();

        assert_eq!(
            broker.bindings("requests-dead-letter"),
            vec!["dead-letter.UserCreatedIntegrationEvent"]
        );
        let parked = broker.messages("requests-dead-letter");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].body, Bytes::from_static(b"{\"payload\":{}}"));
        assert_eq!(
            parked[0].headers[ORIGINAL_ROUTING_KEY_HEADER],
            "UserCreatedIntegrationEvent"
        );
        assert_eq!(parked[0].headers[DELIVERY_COUNT_HEADER], "10");
        assert!(parked[0].headers[DEAD_LETTER_REASON_HEADER].contains("db down"));
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_broker_dlq_fails_when_broker_down() {
        let broker = MemoryBroker::default();
        broker.set_available(false).unwrap();
        let dlq = BrokerDlqHandler::new(Arc::new(broker), "dead-letter");

        let result = dlq
            .handle(DeadLetterEvent::new(
                test_message(1),
                DeadLetterReason::UnknownEventType,
            ))
            .await;
        assert!(result.is_err());
        assert_eq!(dlq.count().await.unwrap(), 0);
    }
}
