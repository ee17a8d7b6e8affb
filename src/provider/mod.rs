//! Broker trait: the transport abstraction behind the bus
//!
//! Backends (NATS JetStream, in-memory) implement `Broker` to publish
//! serialized envelopes and to declare a durable queue bound to a set
//! of routing keys. Deliveries come back as `InFlightMessage`s that
//! must be settled exactly once.

use crate::error::Result;
use crate::types::{OutgoingMessage, ReceivedMessage};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Durable queue plus one binding per routing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerBinding {
    /// Durable queue name (one per consuming service)
    pub queue: String,

    /// Routing keys bound to the queue
    pub routing_keys: Vec<String>,

    /// Maximum unacknowledged deliveries handed to this consumer
    pub prefetch: usize,

    /// How long the broker waits for a settlement before redelivering
    pub ack_wait: Duration,
}

/// Core trait for broker backends
///
/// A broker instance represents one connection shared by the publisher
/// and by every concurrent delivery of the consumer loop, so all methods
/// take `&self` and implementations serialize protocol operations
/// internally.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message, returning the broker-assigned sequence number
    async fn publish(&self, message: &OutgoingMessage) -> Result<u64>;

    /// Declare the durable queue, bind every routing key, and start receiving
    ///
    /// Idempotent: called again after a reconnect to re-declare and re-bind.
    async fn consume(&self, binding: &ConsumerBinding) -> Result<Box<dyn Deliveries>>;

    /// Declare the durable queue and add the binding's routing keys
    /// without consuming from it
    ///
    /// Bindings already present on the queue are kept, so this can be
    /// called repeatedly with one key at a time.
    async fn declare(&self, binding: &ConsumerBinding) -> Result<()>;

    /// Returns true if the broker is connected and operational
    async fn health(&self) -> Result<bool>;

    /// Broker name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}

/// Stream of deliveries for one consumer session
#[async_trait]
pub trait Deliveries: Send {
    /// Wait for the next delivery
    ///
    /// `Ok(None)` means the broker closed the session; `Err` means the
    /// connection was lost. Both require a reconnect.
    async fn next(&mut self) -> Result<Option<InFlightMessage>>;
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type NakFn = Box<dyn FnOnce(Option<Duration>) -> BoxFuture<'static, Result<()>> + Send>;

/// A delivered, unacknowledged message
///
/// Settling consumes the handle, so a message is acked or nacked at
/// most once. Dropping it unsettled leaves redelivery to the broker.
pub struct InFlightMessage {
    /// The received message
    pub received: ReceivedMessage,

    ack_fn: AckFn,

    nak_fn: NakFn,
}

impl InFlightMessage {
    /// Create a new in-flight message with ack/nak callbacks
    pub fn new(
        received: ReceivedMessage,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce(Option<Duration>) -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            received,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
        }
    }

    /// Acknowledge: remove the message from the queue permanently
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge: return the message to the queue, optionally
    /// asking the broker to hold it back for `delay`
    pub async fn nak(self, delay: Option<Duration>) -> Result<()> {
        (self.nak_fn)(delay).await
    }
}

impl std::fmt::Debug for InFlightMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightMessage")
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}
