//! In-memory broker for tests and single-process use
//!
//! Models the durable exchange/queue/binding semantics of a real broker
//! inside one process: queues outlive consumer sessions, every delivery
//! increments the message's delivery count, and messages that were
//! delivered but not settled go back to the head of the queue when their
//! session ends. `disconnect()` and `set_available()` simulate connection
//! drops and outages.

use super::{Broker, ConsumerBinding, Deliveries, InFlightMessage};
use crate::error::{BusError, Result};
use crate::types::{OutgoingMessage, ReceivedMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Memory broker configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Number of published messages retained for inspection (0 = none)
    pub max_published: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_published: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    routing_key: String,
    body: Bytes,
    headers: HashMap<String, String>,
    num_delivered: u64,
    not_before: Option<Instant>,
}

struct Queue {
    bindings: HashSet<String>,
    ready: VecDeque<StoredMessage>,
    /// sequence → (session, message)
    unacked: HashMap<u64, (u64, StoredMessage)>,
    notify: Arc<Notify>,
}

impl Queue {
    fn new() -> Self {
        Self {
            bindings: HashSet::new(),
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Return unacked messages to the head of the queue, oldest first.
    /// `None` requeues every session's messages.
    fn requeue_unacked(&mut self, session: Option<u64>) {
        let mut sequences: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| session.map_or(true, |s| s == *owner))
            .map(|(seq, _)| *seq)
            .collect();
        sequences.sort_unstable();

        for seq in sequences.into_iter().rev() {
            if let Some((_, msg)) = self.unacked.remove(&seq) {
                self.ready.push_front(msg);
            }
        }
        self.notify.notify_waiters();
    }
}

struct BrokerState {
    available: bool,
    next_sequence: u64,
    next_session: u64,
    sessions: HashSet<u64>,
    queues: HashMap<String, Queue>,
    published: VecDeque<OutgoingMessage>,
}

fn lock_state(state: &Mutex<BrokerState>) -> Result<MutexGuard<'_, BrokerState>> {
    state
        .lock()
        .map_err(|e| BusError::Consumer(format!("Memory broker lock poisoned: {}", e)))
}

/// In-process broker with durable queues and at-least-once redelivery
///
/// Cloning shares the same broker state, so a test can keep a handle
/// to simulate failures while the bus owns another.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    config: MemoryConfig,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                next_sequence: 0,
                next_session: 0,
                sessions: HashSet::new(),
                queues: HashMap::new(),
                published: VecDeque::new(),
            })),
            config,
        }
    }

    /// Declare a durable queue and bind a routing key to it without consuming
    pub fn bind(&self, queue: &str, routing_key: &str) -> Result<()> {
        let mut state = lock_state(&self.state)?;
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(Queue::new)
            .bindings
            .insert(routing_key.to_string());
        Ok(())
    }

    /// Drop every consumer session; unacked messages are requeued
    pub fn disconnect(&self) -> Result<()> {
        let mut state = lock_state(&self.state)?;
        state.sessions.clear();
        for queue in state.queues.values_mut() {
            queue.requeue_unacked(None);
        }
        tracing::info!("Memory broker connections dropped");
        Ok(())
    }

    /// Toggle broker reachability; going down also drops every session
    pub fn set_available(&self, available: bool) -> Result<()> {
        {
            let mut state = lock_state(&self.state)?;
            state.available = available;
        }
        if !available {
            self.disconnect()?;
        }
        Ok(())
    }

    /// Messages waiting for delivery on a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock_state(&self.state)
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Messages delivered from a queue but not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock_state(&self.state)
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.unacked.len()))
            .unwrap_or(0)
    }

    /// Routing keys bound to a queue, sorted
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        let mut keys: Vec<String> = lock_state(&self.state)
            .ok()
            .and_then(|s| {
                s.queues
                    .get(queue)
                    .map(|q| q.bindings.iter().cloned().collect())
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Snapshot of the messages waiting on a queue
    pub fn messages(&self, queue: &str) -> Vec<ReceivedMessage> {
        lock_state(&self.state)
            .ok()
            .and_then(|s| {
                s.queues.get(queue).map(|q| {
                    q.ready
                        .iter()
                        .map(|m| to_received(m, queue))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    /// Recently published messages, oldest first
    pub fn published(&self) -> Vec<OutgoingMessage> {
        lock_state(&self.state)
            .map(|s| s.published.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn to_received(msg: &StoredMessage, queue: &str) -> ReceivedMessage {
    ReceivedMessage {
        routing_key: msg.routing_key.clone(),
        body: msg.body.clone(),
        num_delivered: msg.num_delivered,
        sequence: msg.sequence,
        queue: queue.to_string(),
        headers: msg.headers.clone(),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: &OutgoingMessage) -> Result<u64> {
        let mut state = lock_state(&self.state)?;
        if !state.available {
            return Err(BusError::Unavailable("memory broker is down".to_string()));
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;

        for queue in state.queues.values_mut() {
            if queue.bindings.contains(&message.routing_key) {
                queue.ready.push_back(StoredMessage {
                    sequence,
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                    headers: message.headers.clone(),
                    num_delivered: 0,
                    not_before: None,
                });
                queue.notify.notify_waiters();
            }
        }

        if self.config.max_published > 0 {
            state.published.push_back(message.clone());
            while state.published.len() > self.config.max_published {
                state.published.pop_front();
            }
        }

        Ok(sequence)
    }

    async fn consume(&self, binding: &ConsumerBinding) -> Result<Box<dyn Deliveries>> {
        if binding.routing_keys.is_empty() {
            return Err(BusError::Subscribe {
                queue: binding.queue.clone(),
                reason: "no routing keys to bind".to_string(),
            });
        }

        let mut state = lock_state(&self.state)?;
        if !state.available {
            return Err(BusError::Unavailable("memory broker is down".to_string()));
        }

        state.next_session += 1;
        let session = state.next_session;
        state.sessions.insert(session);

        let queue = state
            .queues
            .entry(binding.queue.clone())
            .or_insert_with(Queue::new);
        queue.bindings.extend(binding.routing_keys.iter().cloned());
        let notify = queue.notify.clone();

        tracing::debug!(
            queue = %binding.queue,
            routing_keys = ?binding.routing_keys,
            session,
            "Memory queue declared and bound"
        );

        Ok(Box::new(MemoryDeliveries {
            state: self.state.clone(),
            queue: binding.queue.clone(),
            session,
            notify,
        }))
    }

    async fn declare(&self, binding: &ConsumerBinding) -> Result<()> {
        let mut state = lock_state(&self.state)?;
        if !state.available {
            return Err(BusError::Unavailable("memory broker is down".to_string()));
        }

        state
            .queues
            .entry(binding.queue.clone())
            .or_insert_with(Queue::new)
            .bindings
            .extend(binding.routing_keys.iter().cloned());

        tracing::debug!(
            queue = %binding.queue,
            routing_keys = ?binding.routing_keys,
            "Memory queue declared"
        );
        Ok(())
    }

    async fn health(&self) -> Result<bool> {
        Ok(lock_state(&self.state)?.available)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// One consumer session on a memory queue
struct MemoryDeliveries {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    session: u64,
    notify: Arc<Notify>,
}

impl MemoryDeliveries {
    fn in_flight(&self, msg: &StoredMessage) -> InFlightMessage {
        let received = to_received(msg, &self.queue);
        let sequence = msg.sequence;

        let ack_state = self.state.clone();
        let ack_queue = self.queue.clone();
        let session = self.session;
        let nak_state = self.state.clone();
        let nak_queue = self.queue.clone();

        InFlightMessage::new(
            received,
            move || {
                async move {
                    let mut state = lock_state(&ack_state)?;
                    if !state.sessions.contains(&session) {
                        return Err(BusError::Ack(format!(
                            "session closed before ack of message {}",
                            sequence
                        )));
                    }
                    let queue = state
                        .queues
                        .get_mut(&ack_queue)
                        .ok_or_else(|| BusError::Ack(format!("queue '{}' is gone", ack_queue)))?;
                    queue
                        .unacked
                        .remove(&sequence)
                        .map(|_| ())
                        .ok_or_else(|| BusError::Ack(format!("message {} is not in flight", sequence)))
                }
                .boxed()
            },
            move |delay| {
                async move {
                    let mut state = lock_state(&nak_state)?;
                    if !state.sessions.contains(&session) {
                        return Err(BusError::Ack(format!(
                            "session closed before nak of message {}",
                            sequence
                        )));
                    }
                    let queue = state
                        .queues
                        .get_mut(&nak_queue)
                        .ok_or_else(|| BusError::Ack(format!("queue '{}' is gone", nak_queue)))?;
                    let (_, mut msg) = queue.unacked.remove(&sequence).ok_or_else(|| {
                        BusError::Ack(format!("message {} is not in flight", sequence))
                    })?;
                    msg.not_before = delay.map(|d| Instant::now() + d);
                    queue.ready.push_back(msg);
                    queue.notify.notify_waiters();
                    Ok(())
                }
                .boxed()
            },
        )
    }
}

#[async_trait]
impl Deliveries for MemoryDeliveries {
    async fn next(&mut self) -> Result<Option<InFlightMessage>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = lock_state(&self.state)?;
                if !state.available || !state.sessions.contains(&self.session) {
                    return Err(BusError::Connection(
                        "memory broker connection lost".to_string(),
                    ));
                }

                let now = Instant::now();
                let queue = state.queues.get_mut(&self.queue).ok_or_else(|| {
                    BusError::Consumer(format!("queue '{}' does not exist", self.queue))
                })?;

                let ready_pos = queue
                    .ready
                    .iter()
                    .position(|m| m.not_before.map_or(true, |t| t <= now));

                if let Some(mut msg) = ready_pos.and_then(|pos| queue.ready.remove(pos)) {
                    msg.num_delivered += 1;
                    msg.not_before = None;
                    queue.unacked.insert(msg.sequence, (self.session, msg.clone()));
                    return Ok(Some(self.in_flight(&msg)));
                }

                queue.ready.iter().filter_map(|m| m.not_before).min()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl Drop for MemoryDeliveries {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.sessions.remove(&self.session);
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.requeue_unacked(Some(self.session));
            }
        }
    }
}
