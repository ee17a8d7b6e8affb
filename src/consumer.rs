//! Broker consumer loop
//!
//! One long-lived background task per consuming service:
//!
//! ```text
//! Stopped -> Starting -> Connected -> Consuming -> {Reconnecting -> Connected} -> Stopping -> Stopped
//! ```
//!
//! - **Starting** declares the durable queue and binds every routing key
//!   in the (already complete) subscription registry.
//! - **Consuming** pulls deliveries while a concurrency permit is free and
//!   dispatches each one on its own task. Success acks; a handler error or
//!   timeout nacks for redelivery until the attempt budget is spent, then
//!   dead-letters; unknown routing keys and undecodable payloads are
//!   dead-lettered on the first delivery.
//! - **Reconnecting** retries `Broker::consume` with exponential backoff
//!   until the queue is re-declared and re-bound. Deliveries that were in
//!   flight when the connection dropped come back from the broker.
//! - **Stopping** stops pulling, signals cancellation to running handlers,
//!   waits for them up to the grace period, and aborts whatever is left.

use crate::config::EventBusConfig;
use crate::dlq::{should_dead_letter, DeadLetterEvent, DeadLetterReason, DlqHandler};
use crate::error::{BusError, Result};
use crate::metrics::EventMetrics;
use crate::provider::{Broker, ConsumerBinding, Deliveries, InFlightMessage};
use crate::registry::{DeliveryInfo, DispatchError, SubscriptionRegistry};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Extra time the broker waits for a settlement beyond the handler timeout
const ACK_WAIT_MARGIN: Duration = Duration::from_secs(10);

/// Lifecycle state of the consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Connected,
    Consuming,
    Reconnecting,
    Stopping,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsumerState::Stopped => "stopped",
            ConsumerState::Starting => "starting",
            ConsumerState::Connected => "connected",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Reconnecting => "reconnecting",
            ConsumerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Consumer loop for one service's durable queue
pub struct ConsumerLoop {
    broker: Arc<dyn Broker>,
    processor: Arc<DeliveryProcessor>,
    config: EventBusConfig,
    metrics: Arc<EventMetrics>,
}

impl ConsumerLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<SubscriptionRegistry>,
        dlq: Arc<dyn DlqHandler>,
        config: EventBusConfig,
        metrics: Arc<EventMetrics>,
    ) -> Self {
        let processor = Arc::new(DeliveryProcessor {
            registry,
            dlq,
            config: config.clone(),
            metrics: metrics.clone(),
        });
        Self {
            broker,
            processor,
            config,
            metrics,
        }
    }

    /// Queue and bindings this loop declares
    pub fn binding(&self) -> ConsumerBinding {
        ConsumerBinding {
            queue: self.config.subscription_client_name.clone(),
            routing_keys: self.processor.registry.routing_keys(),
            prefetch: self.config.concurrency,
            ack_wait: self.config.handler_timeout() + ACK_WAIT_MARGIN,
        }
    }

    /// Spawn the loop on the current Tokio runtime
    ///
    /// Fails if no handler is registered, since there would be nothing to
    /// bind. Broker errors do not fail the spawn: the loop keeps retrying
    /// the connection with backoff until it succeeds or is shut down.
    pub fn spawn(self) -> Result<ConsumerHandle> {
        self.config.validate()?;
        if self.processor.registry.is_empty() {
            return Err(BusError::Config(
                "Cannot start consumer: no handlers registered".to_string(),
            ));
        }

        let (state_tx, state_rx) = watch::channel(ConsumerState::Stopped);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(state_tx, shutdown.clone()));

        Ok(ConsumerHandle {
            state: state_rx,
            shutdown,
            task,
        })
    }

    async fn run(self, state_tx: watch::Sender<ConsumerState>, shutdown: CancellationToken) {
        let binding = self.binding();
        state_tx.send_replace(ConsumerState::Starting);
        tracing::info!(
            queue = %binding.queue,
            routing_keys = ?binding.routing_keys,
            broker = self.broker.name(),
            "Consumer loop starting"
        );

        let Some(mut deliveries) = self.connect(&binding, &state_tx, &shutdown).await else {
            state_tx.send_replace(ConsumerState::Stopped);
            tracing::info!(queue = %binding.queue, "Consumer loop stopped before connecting");
            return;
        };

        let handler_cancel = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Handler task failed");
                    }
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = deliveries.next() => next,
            };

            let lost = match next {
                Ok(Some(message)) => {
                    let processor = self.processor.clone();
                    let cancel = handler_cancel.clone();
                    in_flight.spawn(async move {
                        processor.process(message, cancel).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => "session closed by broker".to_string(),
                Err(e) => e.to_string(),
            };

            drop(permit);
            self.metrics.record_reconnect();
            tracing::warn!(
                queue = %binding.queue,
                reason = %lost,
                in_flight = in_flight.len(),
                "Broker connection lost, reconnecting"
            );
            state_tx.send_replace(ConsumerState::Reconnecting);

            match self.connect(&binding, &state_tx, &shutdown).await {
                Some(fresh) => deliveries = fresh,
                None => break,
            }
        }

        state_tx.send_replace(ConsumerState::Stopping);
        tracing::info!(
            queue = %binding.queue,
            in_flight = in_flight.len(),
            "Consumer loop stopping"
        );

        handler_cancel.cancel();
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                queue = %binding.queue,
                remaining = in_flight.len(),
                grace_secs = grace.as_secs(),
                "Grace period exceeded, aborting in-flight handlers"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        drop(deliveries);
        state_tx.send_replace(ConsumerState::Stopped);
        tracing::info!(queue = %binding.queue, "Consumer loop stopped");
    }

    /// Declare and bind, retrying with backoff; `None` if shut down first
    async fn connect(
        &self,
        binding: &ConsumerBinding,
        state_tx: &watch::Sender<ConsumerState>,
        shutdown: &CancellationToken,
    ) -> Option<Box<dyn Deliveries>> {
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                result = self.broker.consume(binding) => result,
            };

            match result {
                Ok(deliveries) => {
                    state_tx.send_replace(ConsumerState::Connected);
                    tracing::info!(
                        queue = %binding.queue,
                        attempts = attempt + 1,
                        "Queue declared and bound"
                    );
                    state_tx.send_replace(ConsumerState::Consuming);
                    return Some(deliveries);
                }
                Err(e) => {
                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    state_tx.send_replace(ConsumerState::Reconnecting);

                    if e.is_transient() {
                        tracing::warn!(
                            queue = %binding.queue,
                            error = %e,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Broker unavailable, retrying"
                        );
                    } else {
                        tracing::error!(
                            queue = %binding.queue,
                            error = %e,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Failed to declare queue, retrying"
                        );
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// Per-delivery dispatch and settlement policy
struct DeliveryProcessor {
    registry: Arc<SubscriptionRegistry>,
    dlq: Arc<dyn DlqHandler>,
    config: EventBusConfig,
    metrics: Arc<EventMetrics>,
}

impl DeliveryProcessor {
    async fn process(&self, message: InFlightMessage, cancel: CancellationToken) {
        let event_id = message
            .received
            .event_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let span = tracing::info_span!(
            "handle_event",
            event_id = %event_id,
            routing_key = %message.received.routing_key,
            attempt = message.received.num_delivered,
        );

        self.settle(message, cancel).instrument(span).await
    }

    async fn settle(&self, message: InFlightMessage, cancel: CancellationToken) {
        let Some(dispatcher) = self.registry.resolve(&message.received.routing_key) else {
            self.dead_letter(message, DeadLetterReason::UnknownEventType)
                .await;
            return;
        };

        let body = message.received.body.clone();
        let delivery = DeliveryInfo {
            routing_key: message.received.routing_key.clone(),
            attempt: message.received.num_delivered,
            max_attempts: self.config.retry_count,
            cancel: cancel.clone(),
        };

        let invocation = AssertUnwindSafe(dispatcher.dispatch(&body, delivery)).catch_unwind();
        let outcome = tokio::time::timeout(self.config.handler_timeout(), invocation).await;

        match outcome {
            Ok(Ok(Ok(()))) => {
                self.metrics.record_handled();
                tracing::debug!("Event handled");
                if let Err(e) = message.ack().await {
                    tracing::warn!(error = %e, "Ack failed, message will be redelivered");
                }
            }
            Ok(Ok(Err(DispatchError::Decode(e)))) => {
                self.dead_letter(message, DeadLetterReason::MalformedPayload(e.to_string()))
                    .await;
            }
            Ok(Ok(Err(DispatchError::Handler(e)))) => {
                self.retry_or_dead_letter(message, format!("{:#}", e), &cancel)
                    .await;
            }
            Ok(Err(panic)) => {
                let error = format!("handler panicked: {}", panic_message(panic.as_ref()));
                self.retry_or_dead_letter(message, error, &cancel).await;
            }
            Err(_) => {
                let error = format!(
                    "handler timed out after {}s",
                    self.config.handler_timeout_secs
                );
                self.retry_or_dead_letter(message, error, &cancel).await;
            }
        }
    }

    async fn retry_or_dead_letter(
        &self,
        message: InFlightMessage,
        error: String,
        cancel: &CancellationToken,
    ) {
        self.metrics.record_handler_error();
        let attempts = message.received.num_delivered;

        // Shutdown interrupted the attempt; requeue without delay
        if cancel.is_cancelled() {
            tracing::info!(
                error = %error,
                attempt = attempts,
                "Handler interrupted by shutdown, returning message to the queue"
            );
            if let Err(e) = message.nak(None).await {
                tracing::warn!(error = %e, "Nak failed, broker will redeliver after ack wait");
            }
            return;
        }

        if should_dead_letter(&message.received, self.config.retry_count) {
            tracing::error!(error = %error, attempts, "Handler failed on final attempt");
            self.dead_letter(
                message,
                DeadLetterReason::AttemptsExhausted {
                    attempts,
                    last_error: error,
                },
            )
            .await;
            return;
        }

        self.metrics.record_retry();
        tracing::warn!(
            error = %error,
            attempt = attempts,
            max_attempts = self.config.retry_count,
            "Handler failed, message will be redelivered"
        );

        if let Err(e) = message.nak(Some(self.config.retry_delay())).await {
            tracing::warn!(error = %e, "Nak failed, broker will redeliver after ack wait");
        }
    }

    async fn dead_letter(&self, message: InFlightMessage, reason: DeadLetterReason) {
        if reason.is_configuration_error() {
            tracing::error!(
                reason = %reason,
                "Message can never be processed by this service, dead-lettering without retry"
            );
        } else {
            tracing::warn!(reason = %reason, "Dead-lettering message");
        }

        let event = DeadLetterEvent::new(message.received.clone(), reason);
        match self.dlq.handle(event).await {
            Ok(()) => {
                self.metrics.record_dead_letter();
                if let Err(e) = message.ack().await {
                    tracing::warn!(error = %e, "Ack after dead-lettering failed");
                }
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Dead-letter destination rejected message, requeueing"
                );
                if let Err(e) = message.nak(Some(self.config.retry_delay())).await {
                    tracing::warn!(error = %e, "Nak failed, broker will redeliver after ack wait");
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a running consumer loop
pub struct ConsumerHandle {
    state: watch::Receiver<ConsumerState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Current lifecycle state
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver for observing state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Wait until the loop reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: ConsumerState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Stop consuming, wait for in-flight handlers (bounded by the grace
    /// period), and close the session
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| BusError::Consumer(format!("Consumer task failed: {}", e)))
    }
}
