//! Publishing integration events
//!
//! `Publisher` turns a typed envelope into a broker message and reports
//! every failure to its caller. `EventNotifier` sits on top for
//! producing business logic that must not fail its own (already
//! committed) operation because a notification could not be sent.

use crate::error::Result;
use crate::metrics::EventMetrics;
use crate::provider::Broker;
use crate::types::{Envelope, IntegrationEvent, OutgoingMessage};
use std::sync::Arc;
use std::time::Instant;

/// Serializes envelopes and hands them to the broker
///
/// Holds no subscription state. Cheap to clone; clones share the broker
/// connection and metrics.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    metrics: Arc<EventMetrics>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, metrics: Arc<EventMetrics>) -> Self {
        Self { broker, metrics }
    }

    /// Publish an envelope under its event type's routing key,
    /// returning the broker sequence number
    pub async fn publish<E: IntegrationEvent>(&self, event: &Envelope<E>) -> Result<u64> {
        let started = Instant::now();

        let result = match OutgoingMessage::from_envelope(event) {
            Ok(message) => self.broker.publish(&message).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(sequence) => {
                self.metrics.record_publish(started.elapsed());
                tracing::debug!(
                    event_id = %event.id(),
                    routing_key = E::EVENT_TYPE,
                    sequence,
                    "Integration event published"
                );
                Ok(sequence)
            }
            Err(e) => {
                self.metrics.record_publish_error();
                tracing::error!(
                    event_id = %event.id(),
                    routing_key = E::EVENT_TYPE,
                    error = %e,
                    "Failed to publish integration event"
                );
                Err(e)
            }
        }
    }

    /// Wrap a payload in a new envelope and publish it
    pub async fn publish_payload<E: IntegrationEvent>(&self, payload: E) -> Result<Envelope<E>> {
        let envelope = Envelope::new(payload);
        self.publish(&envelope).await?;
        Ok(envelope)
    }
}

/// Result of a best-effort notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Sent; carries the broker sequence number
    Published(u64),
    /// No event bus is configured for this service
    Disabled,
    /// Sending failed; the error has been logged and counted
    Failed(String),
}

impl NotifyOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, NotifyOutcome::Published(_))
    }
}

/// Best-effort publishing for producing services
///
/// Whether an event bus is configured is decided once, when the
/// notifier is built. `notify` never returns an error: a failed publish
/// is logged with the event id and routing key, counted in the metrics,
/// and reported in the outcome, leaving the caller's committed state
/// untouched.
#[derive(Clone)]
pub struct EventNotifier {
    publisher: Option<Publisher>,
}

impl EventNotifier {
    pub fn new(publisher: Publisher) -> Self {
        Self {
            publisher: Some(publisher),
        }
    }

    /// Notifier for a service running without an event bus
    pub fn disabled() -> Self {
        Self { publisher: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.publisher.is_some()
    }

    pub async fn notify<E: IntegrationEvent>(&self, event: &Envelope<E>) -> NotifyOutcome {
        let Some(publisher) = &self.publisher else {
            tracing::debug!(
                event_id = %event.id(),
                routing_key = E::EVENT_TYPE,
                "Event bus disabled, notification skipped"
            );
            return NotifyOutcome::Disabled;
        };

        match publisher.publish(event).await {
            Ok(sequence) => NotifyOutcome::Published(sequence),
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id(),
                    routing_key = E::EVENT_TYPE,
                    error = %e,
                    "Notification not delivered; primary operation unaffected"
                );
                NotifyOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UserCreatedIntegrationEvent;
    use crate::provider::memory::MemoryBroker;
    use crate::types::CONTENT_TYPE;

    fn publisher(broker: &MemoryBroker) -> (Publisher, Arc<EventMetrics>) {
        let metrics = Arc::new(EventMetrics::new());
        (
            Publisher::new(Arc::new(broker.clone()), metrics.clone()),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_publish_uses_event_type_as_routing_key() {
        let broker = MemoryBroker::default();
        let (publisher, metrics) = publisher(&broker);

        let envelope = Envelope::new(UserCreatedIntegrationEvent::new("u1", "A", "B"));
        let seq = publisher.publish(&envelope).await.unwrap();
        assert_eq!(seq, 1);

        let sent = broker.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].routing_key, "UserCreatedIntegrationEvent");
        assert_eq!(sent[0].headers["Content-Type"], CONTENT_TYPE);

        let decoded: Envelope<UserCreatedIntegrationEvent> =
            serde_json::from_slice(&sent[0].body).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(metrics.snapshot().publish_count, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let broker = MemoryBroker::default();
        broker.set_available(false).unwrap();
        let (publisher, metrics) = publisher(&broker);

        let result = publisher
            .publish_payload(UserCreatedIntegrationEvent::new("u1", "A", "B"))
            .await;
        assert!(result.is_err());
        assert_eq!(metrics.snapshot().publish_errors, 1);
        assert_eq!(metrics.snapshot().publish_count, 0);
    }

    #[tokio::test]
    async fn test_notifier_swallows_and_reports_failure() {
        let broker = MemoryBroker::default();
        broker.set_available(false).unwrap();
        let (publisher, metrics) = publisher(&broker);
        let notifier = EventNotifier::new(publisher);

        let envelope = Envelope::new(UserCreatedIntegrationEvent::new("u1", "A", "B"));
        let outcome = notifier.notify(&envelope).await;

        assert!(matches!(outcome, NotifyOutcome::Failed(_)));
        assert_eq!(metrics.snapshot().publish_errors, 1);
    }

    #[tokio::test]
    async fn test_notifier_publishes() {
        let broker = MemoryBroker::default();
        let (publisher, _) = publisher(&broker);
        let notifier = EventNotifier::new(publisher);
        assert!(notifier.is_enabled());

        let envelope = Envelope::new(UserCreatedIntegrationEvent::new("u1", "A", "B"));
        assert!(notifier.notify(&envelope).await.is_published());
    }

    #[tokio::test]
    async fn test_disabled_notifier() {
        let notifier = EventNotifier::disabled();
        assert!(!notifier.is_enabled());

        let envelope = Envelope::new(UserCreatedIntegrationEvent::new("u1", "A", "B"));
        assert_eq!(notifier.notify(&envelope).await, NotifyOutcome::Disabled);
    }
}
