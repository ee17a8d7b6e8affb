//! NATS JetStream client: connect, publish, declare durable consumers

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsDeliveries;
use crate::error::{BusError, Result};
use crate::provider::ConsumerBinding;
use crate::types::OutgoingMessage;
use async_nats::jetstream;
use std::sync::Arc;
use std::time::Duration;

/// NATS JetStream client
///
/// Owns the single connection shared by publishing and consuming.
/// `async_nats::Client` multiplexes concurrent operations over that
/// connection, so no extra locking is needed here.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// Configuration
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and make sure the stream exists
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        config.validate()?;
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            config: Arc::new(config),
        })
    }

    /// Publish a message, returning the JetStream sequence number
    ///
    /// The message id is sent as `Nats-Msg-Id`, so republishing the same
    /// envelope inside the stream's duplicate window is dropped by the server.
    pub async fn publish(&self, message: &OutgoingMessage) -> Result<u64> {
        let subject = self.config.subject_for(&message.routing_key);

        let mut headers = async_nats::HeaderMap::new();
        for (key, value) in &message.headers {
            headers.insert(key.as_str(), value.as_str());
        }
        if let Some(ref msg_id) = message.message_id {
            headers.insert("Nats-Msg-Id", msg_id.as_str());
        }

        let ack_fut = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, message.body.clone())
            .await
            .map_err(|e| BusError::Publish {
                routing_key: message.routing_key.clone(),
                reason: e.to_string(),
            })?;

        let ack = tokio::time::timeout(
            Duration::from_secs(self.config.request_timeout_secs),
            ack_fut,
        )
        .await
        .map_err(|_| {
            BusError::Timeout(format!(
                "Publish ack timed out after {}s for subject '{}'",
                self.config.request_timeout_secs, subject
            ))
        })?
        .map_err(|e| BusError::Publish {
            routing_key: message.routing_key.clone(),
            reason: format!("ack failed: {}", e),
        })?;

        tracing::debug!(
            subject = %subject,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Message published"
        );

        Ok(ack.sequence)
    }

    /// Declare the durable consumer for a queue and start pulling messages
    ///
    /// Re-declares the stream too, so this is safe to call after a reconnect.
    pub async fn consume(&self, binding: &ConsumerBinding) -> Result<NatsDeliveries> {
        if self.client.connection_state() != async_nats::connection::State::Connected {
            return Err(BusError::Connection(format!(
                "not connected to {}",
                self.config.url
            )));
        }
        if binding.routing_keys.is_empty() {
            return Err(BusError::Subscribe {
                queue: binding.queue.clone(),
                reason: "no routing keys to bind".to_string(),
            });
        }

        let stream = ensure_stream(&self.jetstream, &self.config).await?;
        let consumer_config = build_consumer_config(&self.config, binding);

        // create_consumer is create-or-update, so bindings added since the
        // last deployment are applied to the existing durable consumer
        let consumer = stream
            .create_consumer(consumer_config)
            .await
            .map_err(|e| {
                BusError::Consumer(format!(
                    "Failed to declare durable consumer '{}': {}",
                    binding.queue, e
                ))
            })?;

        let messages = consumer.messages().await.map_err(|e| BusError::Subscribe {
            queue: binding.queue.clone(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            queue = %binding.queue,
            routing_keys = ?binding.routing_keys,
            prefetch = binding.prefetch,
            "Durable consumer bound"
        );

        Ok(NatsDeliveries::new(
            messages,
            self.config.clone(),
            binding.queue.clone(),
        ))
    }

    /// Declare a durable consumer without pulling from it
    ///
    /// Filter subjects already on the consumer are kept and the binding's
    /// subjects added, so messages on any of them are retained for it.
    pub async fn declare(&self, binding: &ConsumerBinding) -> Result<()> {
        let stream = ensure_stream(&self.jetstream, &self.config).await?;

        let existing = match stream.consumer_info(&binding.queue).await {
            Ok(info) => {
                let mut subjects = info.config.filter_subjects.clone();
                if !info.config.filter_subject.is_empty() {
                    subjects.push(info.config.filter_subject.clone());
                }
                subjects
            }
            Err(e) => {
                tracing::debug!(queue = %binding.queue, error = %e, "No existing durable consumer");
                Vec::new()
            }
        };

        let mut consumer_config = build_consumer_config(&self.config, binding);
        consumer_config.filter_subjects = merge_subjects(existing, consumer_config.filter_subjects);

        stream
            .create_consumer(consumer_config)
            .await
            .map_err(|e| {
                BusError::Consumer(format!(
                    "Failed to declare durable consumer '{}': {}",
                    binding.queue, e
                ))
            })?;

        tracing::debug!(queue = %binding.queue, "Durable consumer declared");
        Ok(())
    }

    /// Whether the connection is currently up
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

/// Build the durable pull consumer config for a binding
fn build_consumer_config(
    config: &NatsConfig,
    binding: &ConsumerBinding,
) -> jetstream::consumer::pull::Config {
    let filter_subjects = binding
        .routing_keys
        .iter()
        .map(|key| config.subject_for(key))
        .collect();

    jetstream::consumer::pull::Config {
        durable_name: Some(binding.queue.clone()),
        filter_subjects,
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy: jetstream::consumer::DeliverPolicy::All,
        ack_wait: binding.ack_wait,
        max_ack_pending: binding.prefetch as i64,
        ..Default::default()
    }
}

/// Union of two subject lists, keeping first-seen order
fn merge_subjects(mut existing: Vec<String>, added: Vec<String>) -> Vec<String> {
    for subject in added {
        if !existing.contains(&subject) {
            existing.push(subject);
        }
    }
    existing
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the correct configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_age: Duration::from_secs(config.max_age_secs),
        max_bytes: config.max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js.get_or_create_stream(stream_config).await.map_err(|e| {
        BusError::Stream(format!(
            "Failed to create/get stream '{}': {}",
            config.stream_name, e
        ))
    })?;

    tracing::debug!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_binds_every_key() {
        let config = NatsConfig::default();
        let binding = ConsumerBinding {
            queue: "requests".to_string(),
            routing_keys: vec![
                "ItemCreatedIntegrationEvent".to_string(),
                "UserCreatedIntegrationEvent".to_string(),
            ],
            prefetch: 8,
            ack_wait: Duration::from_secs(45),
        };

        let consumer = build_consumer_config(&config, &binding);
        assert_eq!(consumer.durable_name.as_deref(), Some("requests"));
        assert_eq!(
            consumer.filter_subjects,
            vec![
                "integration.ItemCreatedIntegrationEvent",
                "integration.UserCreatedIntegrationEvent"
            ]
        );
        assert_eq!(consumer.max_ack_pending, 8);
        assert_eq!(consumer.ack_wait, Duration::from_secs(45));
        assert_eq!(consumer.ack_policy, jetstream::consumer::AckPolicy::Explicit);
    }

    #[test]
    fn test_merge_subjects_keeps_existing_bindings() {
        let merged = merge_subjects(
            vec!["integration.dead-letter.A".to_string()],
            vec![
                "integration.dead-letter.B".to_string(),
                "integration.dead-letter.A".to_string(),
            ],
        );
        assert_eq!(
            merged,
            vec!["integration.dead-letter.A", "integration.dead-letter.B"]
        );
    }
}
