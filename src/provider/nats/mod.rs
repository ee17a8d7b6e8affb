//! NATS JetStream broker
//!
//! Implements `Broker` on NATS JetStream: the stream is the durable
//! exchange, a durable pull consumer with one filter subject per
//! routing key is the durable queue with its bindings, and JetStream's
//! per-message delivery counter drives the retry policy.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsDeliveries;

use crate::error::Result;
use crate::provider::{Broker, ConsumerBinding, Deliveries};
use crate::types::OutgoingMessage;
use async_trait::async_trait;

/// NATS JetStream broker
///
/// Wraps `NatsClient` and implements the `Broker` trait.
pub struct NatsBroker {
    client: NatsClient,
}

impl NatsBroker {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, message: &OutgoingMessage) -> Result<u64> {
        self.client.publish(message).await
    }

    async fn consume(&self, binding: &ConsumerBinding) -> Result<Box<dyn Deliveries>> {
        let deliveries = self.client.consume(binding).await?;
        Ok(Box::new(deliveries))
    }

    async fn declare(&self, binding: &ConsumerBinding) -> Result<()> {
        self.client.declare(binding).await
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.client.is_connected())
    }

    fn name(&self) -> &str {
        "nats"
    }
}
