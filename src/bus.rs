//! Event bus composition root
//!
//! `EventBusBuilder` is where a service wires everything together at
//! startup: broker, configuration, dead-letter destination, and one
//! handler per integration event type. The finished `EventBus` hands out
//! publishers and starts the consumer loop.

use crate::config::EventBusConfig;
use crate::consumer::{ConsumerHandle, ConsumerLoop};
use crate::dlq::{BrokerDlqHandler, DlqHandler};
use crate::error::Result;
use crate::handler::IntegrationEventHandler;
use crate::metrics::EventMetrics;
use crate::provider::Broker;
use crate::publisher::{EventNotifier, Publisher};
use crate::registry::SubscriptionRegistry;
use crate::types::{Envelope, IntegrationEvent};
use std::sync::Arc;

/// Startup composition for an `EventBus`
pub struct EventBusBuilder {
    broker: Arc<dyn Broker>,
    config: EventBusConfig,
    registry: SubscriptionRegistry,
    dlq: Option<Arc<dyn DlqHandler>>,
}

impl EventBusBuilder {
    pub fn new(broker: impl Broker + 'static) -> Self {
        Self::from_arc(Arc::new(broker))
    }

    /// Build on a broker that is shared with other components
    pub fn from_arc(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            config: EventBusConfig::default(),
            registry: SubscriptionRegistry::new(),
            dlq: None,
        }
    }

    pub fn config(mut self, config: EventBusConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default dead-letter destination
    ///
    /// By default dead-lettered messages are republished on the same
    /// broker under `<deadLetterPrefix>.<routingKey>`.
    pub fn dead_letter_handler(mut self, handler: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(handler);
        self
    }

    /// Register the handler for event type `E`
    ///
    /// Fails with `BusError::DuplicateHandler` if `E` already has one.
    pub fn subscribe<E, H>(mut self, handler: H) -> Result<Self>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        self.registry.register::<E, H>(handler)?;
        Ok(self)
    }

    pub fn build(self) -> Result<EventBus> {
        self.config.validate()?;

        let dlq = self.dlq.unwrap_or_else(|| {
            Arc::new(BrokerDlqHandler::new(
                self.broker.clone(),
                self.config.dead_letter_prefix.clone(),
            ))
        });
        let metrics = Arc::new(EventMetrics::new());

        tracing::info!(
            broker = self.broker.name(),
            queue = %self.config.subscription_client_name,
            handlers = self.registry.len(),
            "Event bus configured"
        );

        Ok(EventBus {
            publisher: Publisher::new(self.broker.clone(), metrics.clone()),
            broker: self.broker,
            registry: Arc::new(self.registry),
            dlq,
            config: self.config,
            metrics,
        })
    }
}

/// Publishing and consuming over one broker
pub struct EventBus {
    broker: Arc<dyn Broker>,
    publisher: Publisher,
    registry: Arc<SubscriptionRegistry>,
    dlq: Arc<dyn DlqHandler>,
    config: EventBusConfig,
    metrics: Arc<EventMetrics>,
}

impl EventBus {
    pub fn builder(broker: impl Broker + 'static) -> EventBusBuilder {
        EventBusBuilder::new(broker)
    }

    /// Publish-only bus with default configuration
    pub fn new(broker: impl Broker + 'static) -> Self {
        let broker: Arc<dyn Broker> = Arc::new(broker);
        let config = EventBusConfig::default();
        let metrics = Arc::new(EventMetrics::new());

        Self {
            publisher: Publisher::new(broker.clone(), metrics.clone()),
            dlq: Arc::new(BrokerDlqHandler::new(
                broker.clone(),
                config.dead_letter_prefix.clone(),
            )),
            broker,
            registry: Arc::new(SubscriptionRegistry::new()),
            config,
            metrics,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.broker.name()
    }

    /// Publisher handle for producing services
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Fire-and-forget notifier bound to this bus
    pub fn notifier(&self) -> EventNotifier {
        EventNotifier::new(self.publisher.clone())
    }

    /// Wrap `payload` in a fresh envelope and publish it
    pub async fn publish<E: IntegrationEvent>(&self, payload: E) -> Result<Envelope<E>> {
        self.publisher.publish_payload(payload).await
    }

    /// Publish a pre-built envelope
    pub async fn publish_event<E: IntegrationEvent>(&self, event: &Envelope<E>) -> Result<u64> {
        self.publisher.publish(event).await
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &EventMetrics {
        &self.metrics
    }

    pub fn dlq_handler(&self) -> &Arc<dyn DlqHandler> {
        &self.dlq
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Whether the broker connection is usable
    pub async fn health(&self) -> Result<bool> {
        self.broker.health().await
    }

    /// Spawn the consumer loop for every registered handler
    ///
    /// Must be called from within a Tokio runtime. Fails if no handler
    /// was registered.
    pub fn start_consumer(&self) -> Result<ConsumerHandle> {
        ConsumerLoop::new(
            self.broker.clone(),
            self.registry.clone(),
            self.dlq.clone(),
            self.config.clone(),
            self.metrics.clone(),
        )
        .spawn()
    }
}
