//! Subscription registry: routing key to handler mapping
//!
//! Populated once during startup composition, then shared read-only
//! (behind an `Arc`) with the consumer loop. Each registration erases
//! the event type behind an `EventDispatcher` that decodes the payload
//! into the handler's expected type, so dispatch needs no runtime
//! type inspection.

use crate::error::{BusError, Result};
use crate::handler::{HandlerContext, IntegrationEventHandler};
use crate::types::{Envelope, IntegrationEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a dispatch did not succeed
#[derive(Debug)]
pub enum DispatchError {
    /// The body could not be decoded into the registered event type
    Decode(serde_json::Error),
    /// The handler ran and failed
    Handler(anyhow::Error),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Decode(e) => write!(f, "malformed payload: {}", e),
            DispatchError::Handler(e) => write!(f, "handler failed: {:#}", e),
        }
    }
}

/// Delivery details the consumer hands to a dispatcher
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    pub routing_key: String,
    pub attempt: u64,
    pub max_attempts: u32,
    pub cancel: CancellationToken,
}

/// Type-erased entry point for one registered event type
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Routing key this dispatcher serves
    fn event_type(&self) -> &'static str;

    /// Decode `body` and invoke the handler
    async fn dispatch(&self, body: &[u8], delivery: DeliveryInfo) -> std::result::Result<(), DispatchError>;
}

struct TypedDispatcher<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> EventDispatcher for TypedDispatcher<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E> + 'static,
{
    fn event_type(&self) -> &'static str {
        E::EVENT_TYPE
    }

    async fn dispatch(&self, body: &[u8], delivery: DeliveryInfo) -> std::result::Result<(), DispatchError> {
        let envelope: Envelope<E> = serde_json::from_slice(body).map_err(DispatchError::Decode)?;
        let ctx = HandlerContext::new(
            envelope.id(),
            delivery.routing_key,
            delivery.attempt,
            delivery.max_attempts,
            delivery.cancel,
        );
        self.handler
            .handle(&envelope, &ctx)
            .await
            .map_err(DispatchError::Handler)
    }
}

/// Routing key → handler table for one consuming service
///
/// At most one handler per event type: registering a second handler for
/// the same key fails with `BusError::DuplicateHandler` and leaves the
/// first registration in place.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: HashMap<String, Arc<dyn EventDispatcher>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for event type `E`
    pub fn register<E, H>(&mut self, handler: H) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        validate_event_type(E::EVENT_TYPE)?;
        if self.handlers.contains_key(E::EVENT_TYPE) {
            return Err(BusError::DuplicateHandler(E::EVENT_TYPE.to_string()));
        }

        self.handlers.insert(
            E::EVENT_TYPE.to_string(),
            Arc::new(TypedDispatcher::<E, H> {
                handler,
                _event: PhantomData,
            }),
        );

        tracing::debug!(event_type = E::EVENT_TYPE, "Handler registered");
        Ok(())
    }

    /// Look up the dispatcher for a routing key
    pub fn resolve(&self, routing_key: &str) -> Option<Arc<dyn EventDispatcher>> {
        self.handlers.get(routing_key).cloned()
    }

    pub fn contains(&self, routing_key: &str) -> bool {
        self.handlers.contains_key(routing_key)
    }

    /// Registered routing keys, sorted
    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.is_empty()
        || event_type.contains(|c: char| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(BusError::Config(format!(
            "Event type '{}' is not a valid routing key",
            event_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl IntegrationEvent for Ping {
        const EVENT_TYPE: &'static str = "PingIntegrationEvent";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Dotted;

    impl IntegrationEvent for Dotted {
        const EVENT_TYPE: &'static str = "bad.key";
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IntegrationEventHandler<Ping> for Counting {
        async fn handle(&self, event: &Envelope<Ping>, ctx: &HandlerContext) -> anyhow::Result<()> {
            assert_eq!(ctx.event_id, event.id());
            self.calls.fetch_add(event.payload().n as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl IntegrationEventHandler<Dotted> for Counting {
        async fn handle(&self, _: &Envelope<Dotted>, _: &HandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn delivery() -> DeliveryInfo {
        DeliveryInfo {
            routing_key: "PingIntegrationEvent".to_string(),
            attempt: 1,
            max_attempts: 10,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let handler = Arc::new(Counting::default());
        let mut registry = SubscriptionRegistry::new();
        registry.register::<Ping, _>(handler.clone()).unwrap();

        let dispatcher = registry.resolve("PingIntegrationEvent").unwrap();
        assert_eq!(dispatcher.event_type(), "PingIntegrationEvent");

        let body = serde_json::to_vec(&Envelope::new(Ping { n: 3 })).unwrap();
        dispatcher.dispatch(&body, delivery()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = SubscriptionRegistry::new();
        registry.register::<Ping, _>(Counting::default()).unwrap();

        let err = registry.register::<Ping, _>(Counting::default()).unwrap_err();
        assert!(matches!(err, BusError::DuplicateHandler(ref key) if key == "PingIntegrationEvent"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_key() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.resolve("PingIntegrationEvent").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_event_type_rejected() {
        let mut registry = SubscriptionRegistry::new();
        assert!(matches!(
            registry.register::<Dotted, _>(Counting::default()),
            Err(BusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_decode_error() {
        let mut registry = SubscriptionRegistry::new();
        registry.register::<Ping, _>(Counting::default()).unwrap();

        let dispatcher = registry.resolve("PingIntegrationEvent").unwrap();
        let result = dispatcher.dispatch(b"{\"id\": 1}", delivery()).await;
        assert!(matches!(result, Err(DispatchError::Decode(_))));
    }

    #[test]
    fn test_routing_keys_sorted() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Alpha;
        impl IntegrationEvent for Alpha {
            const EVENT_TYPE: &'static str = "AlphaIntegrationEvent";
        }

        struct Noop;
        #[async_trait]
        impl IntegrationEventHandler<Alpha> for Noop {
            async fn handle(&self, _: &Envelope<Alpha>, _: &HandlerContext) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let mut registry = SubscriptionRegistry::new();
        registry.register::<Ping, _>(Counting::default()).unwrap();
        registry.register::<Alpha, _>(Noop).unwrap();

        assert_eq!(
            registry.routing_keys(),
            vec!["AlphaIntegrationEvent", "PingIntegrationEvent"]
        );
        assert!(registry.contains("AlphaIntegrationEvent"));
    }
}
