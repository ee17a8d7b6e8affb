//! NATS durable consumer session: adapts JetStream messages to in-flight deliveries

use super::config::NatsConfig;
use crate::error::{BusError, Result};
use crate::provider::{Deliveries, InFlightMessage};
use crate::types::{ReceivedMessage, CONTENT_TYPE_HEADER};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

/// Pull-consumer message stream for one durable queue
pub struct NatsDeliveries {
    messages: jetstream::consumer::pull::Stream,
    config: Arc<NatsConfig>,
    queue: String,
}

impl NatsDeliveries {
    pub(crate) fn new(
        messages: jetstream::consumer::pull::Stream,
        config: Arc<NatsConfig>,
        queue: String,
    ) -> Self {
        Self {
            messages,
            config,
            queue,
        }
    }

    fn to_in_flight(&self, msg: jetstream::Message) -> Result<InFlightMessage> {
        let info = msg
            .info()
            .map_err(|e| BusError::Consumer(format!("Missing JetStream metadata: {}", e)))?;
        let num_delivered = info.delivered.max(1) as u64;
        let sequence = info.stream_sequence;

        let subject = msg.subject.to_string();
        let routing_key = self
            .config
            .routing_key_of(&subject)
            .unwrap_or(subject.as_str())
            .to_string();

        let mut headers = HashMap::new();
        if let Some(content_type) = msg
            .headers
            .as_ref()
            .and_then(|h| h.get(CONTENT_TYPE_HEADER))
        {
            headers.insert(
                CONTENT_TYPE_HEADER.to_string(),
                content_type.as_str().to_string(),
            );
        }

        let received = ReceivedMessage {
            routing_key,
            body: msg.payload.clone(),
            num_delivered,
            sequence,
            queue: self.queue.clone(),
            headers,
        };

        let msg = Arc::new(msg);
        let ack_msg = msg.clone();
        let nak_msg = msg;

        Ok(InFlightMessage::new(
            received,
            move || {
                async move {
                    ack_msg
                        .ack()
                        .await
                        .map_err(|e| BusError::Ack(e.to_string()))
                }
                .boxed()
            },
            move |delay| {
                async move {
                    nak_msg
                        .ack_with(AckKind::Nak(delay))
                        .await
                        .map_err(|e| BusError::Ack(format!("nak failed: {}", e)))
                }
                .boxed()
            },
        ))
    }
}

#[async_trait]
impl Deliveries for NatsDeliveries {
    async fn next(&mut self) -> Result<Option<InFlightMessage>> {
        match self.messages.next().await {
            Some(Ok(msg)) => self.to_in_flight(msg).map(Some),
            Some(Err(e)) => Err(BusError::Connection(format!(
                "Consumer '{}' stream error: {}",
                self.queue, e
            ))),
            None => Ok(None),
        }
    }
}
