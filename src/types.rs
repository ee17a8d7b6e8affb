//! Core message types for the integration bus
//!
//! All wire types use camelCase JSON serialization.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Content type declared on every message the bus publishes
pub const CONTENT_TYPE: &str = "application/json";

/// Header carrying the content type
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// A fact broadcast by one service for other services to react to
///
/// `EVENT_TYPE` is the stable logical name used as the routing key
/// (e.g. `UserCreatedIntegrationEvent`). It must be a single token:
/// no dots, spaces, or wildcards.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Routing key / registry key for this event type
    const EVENT_TYPE: &'static str;
}

/// Wire envelope for an integration event
///
/// Identity and creation timestamp are generated at construction and
/// never change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<E> {
    id: Uuid,
    creation_date: DateTime<Utc>,
    payload: E,
}

/// Envelope whose payload has not been bound to a concrete event type
pub type RawEnvelope = Envelope<serde_json::Value>;

impl<E> Envelope<E> {
    /// Wrap a payload with a fresh id and the current UTC time
    pub fn new(payload: E) -> Self {
        Self {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
            payload,
        }
    }

    /// Unique event identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// UTC creation timestamp
    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    /// Event-specific payload
    pub fn payload(&self) -> &E {
        &self.payload
    }
}

impl<E: IntegrationEvent> Envelope<E> {
    /// Routing key derived from the event's declared type name
    pub fn routing_key(&self) -> &'static str {
        E::EVENT_TYPE
    }
}

/// A serialized message ready to be handed to a broker
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Routing key (event type name)
    pub routing_key: String,

    /// Serialized envelope
    pub body: Bytes,

    /// Broker-level message id, when the broker supports deduplication
    pub message_id: Option<String>,

    /// Message headers
    pub headers: HashMap<String, String>,
}

impl OutgoingMessage {
    /// Serialize an envelope into an outgoing message keyed by its event type
    pub fn from_envelope<E: IntegrationEvent>(envelope: &Envelope<E>) -> crate::Result<Self> {
        let body = serde_json::to_vec(envelope)?;
        let mut headers = HashMap::new();
        headers.insert(CONTENT_TYPE_HEADER.to_string(), CONTENT_TYPE.to_string());

        Ok(Self {
            routing_key: E::EVENT_TYPE.to_string(),
            body: Bytes::from(body),
            message_id: Some(envelope.id().to_string()),
            headers,
        })
    }
}

/// A delivered message with its delivery context
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Routing key the message was published under
    pub routing_key: String,

    /// Raw message body
    pub body: Bytes,

    /// Number of times the broker has delivered this message (1 on first delivery)
    pub num_delivered: u64,

    /// Broker-assigned sequence number
    pub sequence: u64,

    /// Queue the message was consumed from
    pub queue: String,

    /// Message headers
    pub headers: HashMap<String, String>,
}

impl ReceivedMessage {
    /// Best-effort event id, read without binding the payload type
    pub fn event_id(&self) -> Option<Uuid> {
        serde_json::from_slice::<RawEnvelope>(&self.body)
            .ok()
            .map(|env| env.id())
    }

    /// Whether this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.num_delivered > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderPlaced {
        order_id: String,
        total: u32,
    }

    impl IntegrationEvent for OrderPlaced {
        const EVENT_TYPE: &'static str = "OrderPlacedIntegrationEvent";
    }

    fn order() -> OrderPlaced {
        OrderPlaced {
            order_id: "ord-1".to_string(),
            total: 42,
        }
    }

    #[test]
    fn test_envelope_generates_identity() {
        let a = Envelope::new(order());
        let b = Envelope::new(order());

        assert_ne!(a.id(), b.id());
        assert!(a.creation_date() <= Utc::now());
        assert_eq!(a.routing_key(), "OrderPlacedIntegrationEvent");
        assert_eq!(a.payload().order_id, "ord-1");
    }

    #[test]
    fn test_envelope_wire_format() {
        let env = Envelope::new(order());
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(json["id"], env.id().to_string());
        assert!(json["creationDate"].is_string());
        assert_eq!(json["payload"]["orderId"], "ord-1");
        assert_eq!(json["payload"]["total"], 42);
    }

    #[test]
    fn test_envelope_decodes_as_raw() {
        let env = Envelope::new(order());
        let bytes = serde_json::to_vec(&env).unwrap();

        let raw: RawEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw.id(), env.id());
        assert_eq!(raw.creation_date(), env.creation_date());
        assert_eq!(raw.payload()["total"], 42);
    }

    #[test]
    fn test_outgoing_message_from_envelope() {
        let env = Envelope::new(order());
        let msg = OutgoingMessage::from_envelope(&env).unwrap();

        assert_eq!(msg.routing_key, "OrderPlacedIntegrationEvent");
        assert_eq!(msg.message_id.as_deref(), Some(env.id().to_string().as_str()));
        assert_eq!(msg.headers[CONTENT_TYPE_HEADER], CONTENT_TYPE);

        let decoded: Envelope<OrderPlaced> = serde_json::from_slice(&msg.body).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_received_message_event_id() {
        let env = Envelope::new(order());
        let msg = ReceivedMessage {
            routing_key: "OrderPlacedIntegrationEvent".to_string(),
            body: Bytes::from(serde_json::to_vec(&env).unwrap()),
            num_delivered: 2,
            sequence: 7,
            queue: "orders".to_string(),
            headers: HashMap::new(),
        };

        assert_eq!(msg.event_id(), Some(env.id()));
        assert!(msg.is_redelivery());
    }

    #[test]
    fn test_received_message_garbage_body() {
        let msg = ReceivedMessage {
            routing_key: "X".to_string(),
            body: Bytes::from_static(b"not json"),
            num_delivered: 1,
            sequence: 1,
            queue: "q".to_string(),
            headers: HashMap::new(),
        };

        assert!(msg.event_id().is_none());
        assert!(!msg.is_redelivery());
    }
}
