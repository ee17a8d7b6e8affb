//! # integration-bus
//!
//! Asynchronous integration events between services over a durable
//! message broker.
//!
//! ## Overview
//!
//! Producing services publish typed integration events; every consuming
//! service owns one durable queue bound to the event types it handles.
//! Delivery is at-least-once: handlers must be idempotent, failed
//! deliveries are redelivered a bounded number of times, and messages
//! that can never succeed end up in a dead-letter destination instead of
//! being dropped.
//!
//! ## Quick Start
//!
//! ```rust
//! use integration_bus::{EventBus, MemoryBroker, UserCreatedIntegrationEvent};
//! use integration_bus::services::{MemoryUserService, UserCreatedHandler};
//! use std::sync::Arc;
//!
//! # async fn example() -> integration_bus::Result<()> {
//! let users = Arc::new(MemoryUserService::new());
//! let bus = EventBus::builder(MemoryBroker::default())
//!     .subscribe::<UserCreatedIntegrationEvent, _>(UserCreatedHandler::new(users.clone()))?
//!     .build()?;
//!
//! let consumer = bus.start_consumer()?;
//!
//! bus.publish(UserCreatedIntegrationEvent::new("u1", "Ada", "Lovelace")).await?;
//!
//! consumer.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Brokers
//!
//! - **memory**: In-process broker for testing and single-process use
//! - **nats**: NATS JetStream. The stream is the durable exchange; each
//!   durable pull consumer is a service queue bound by subject filters
//!
//! ## Architecture
//!
//! - **Broker** trait: publish, declare/bind/consume, settle
//! - **Publisher** / **EventNotifier**: producing side
//! - **SubscriptionRegistry**: routing key → typed handler
//! - **ConsumerLoop**: dispatch, retry, dead-letter, reconnect, shutdown
//! - **EventBus**: explicit startup composition of all of the above

pub mod bus;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod events;
pub mod handler;
pub mod metrics;
pub mod provider;
pub mod publisher;
pub mod registry;
pub mod services;
pub mod types;

// Re-export core types
pub use bus::{EventBus, EventBusBuilder};
pub use config::{BackoffConfig, EventBusConfig};
pub use consumer::{ConsumerHandle, ConsumerLoop, ConsumerState};
pub use dlq::{
    BrokerDlqHandler, DeadLetterEvent, DeadLetterReason, DlqHandler, MemoryDlqHandler,
};
pub use error::{BusError, Result};
pub use events::{ItemCreatedIntegrationEvent, UserCreatedIntegrationEvent};
pub use handler::{HandlerContext, IntegrationEventHandler};
pub use metrics::{EventMetrics, MetricsSnapshot};
pub use provider::{Broker, ConsumerBinding, Deliveries, InFlightMessage};
pub use publisher::{EventNotifier, NotifyOutcome, Publisher};
pub use registry::SubscriptionRegistry;
pub use types::{Envelope, IntegrationEvent, OutgoingMessage, RawEnvelope, ReceivedMessage};

// Re-export brokers for convenience
pub use provider::memory::{MemoryBroker, MemoryConfig};
pub use provider::nats::{NatsBroker, NatsClient, NatsConfig, NatsDeliveries, StorageType};
