//! Handler contract for integration events
//!
//! Delivery is at-least-once: the same envelope may reach a handler more
//! than once (redelivery after a failure, after a reconnect, or after a
//! shutdown that outlived its grace period). Handlers must therefore be
//! side-effect idempotent, typically by checking whether the referenced
//! entity already exists before creating it.

use crate::types::{Envelope, IntegrationEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Reacts to one integration event type
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync {
    /// Handle one delivery. Returning an error schedules a retry until
    /// the attempt budget is spent, after which the message is dead-lettered.
    async fn handle(&self, event: &Envelope<E>, ctx: &HandlerContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<E, H> IntegrationEventHandler<E> for Arc<H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E> + ?Sized,
{
    async fn handle(&self, event: &Envelope<E>, ctx: &HandlerContext) -> anyhow::Result<()> {
        (**self).handle(event, ctx).await
    }
}

/// Delivery context passed to every handler invocation
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Envelope id of the event being handled
    pub event_id: Uuid,

    /// Routing key the event arrived under
    pub routing_key: String,

    /// Delivery attempt, starting at 1
    pub attempt: u64,

    /// Attempts allowed before the message is dead-lettered
    pub max_attempts: u32,

    cancel: CancellationToken,
}

impl HandlerContext {
    pub fn new(
        event_id: Uuid,
        routing_key: impl Into<String>,
        attempt: u64,
        max_attempts: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            event_id,
            routing_key: routing_key.into(),
            attempt,
            max_attempts,
            cancel,
        }
    }

    /// True once the consumer is shutting down
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the consumer starts shutting down
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Token for handing cancellation to downstream calls
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether a failure on this attempt dead-letters the message
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= u64::from(self.max_attempts)
    }
}
