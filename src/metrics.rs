//! Bus metrics: lock-free counters for publish and dispatch outcomes

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared by the publisher, notifier and consumer loop
#[derive(Debug, Default)]
pub struct EventMetrics {
    publish_count: AtomicU64,
    publish_errors: AtomicU64,
    publish_latency_us: AtomicU64,
    handled_count: AtomicU64,
    handler_errors: AtomicU64,
    retry_count: AtomicU64,
    dead_letter_count: AtomicU64,
    reconnect_count: AtomicU64,
}

impl EventMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self, latency: Duration) {
        self.publish_count.fetch_add(1, Ordering::Relaxed);
        self.publish_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handled(&self) {
        self.handled_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letter_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let publish_count = self.publish_count.load(Ordering::Relaxed);
        let total_latency = self.publish_latency_us.load(Ordering::Relaxed);

        MetricsSnapshot {
            publish_count,
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            avg_publish_latency_us: if publish_count > 0 {
                total_latency / publish_count
            } else {
                0
            },
            handled_count: self.handled_count.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            dead_letter_count: self.dead_letter_count.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.publish_count,
            &self.publish_errors,
            &self.publish_latency_us,
            &self.handled_count,
            &self.handler_errors,
            &self.retry_count,
            &self.dead_letter_count,
            &self.reconnect_count,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Serializable view of `EventMetrics`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub publish_count: u64,
    pub publish_errors: u64,
    pub avg_publish_latency_us: u64,
    pub handled_count: u64,
    pub handler_errors: u64,
    pub retry_count: u64,
    pub dead_letter_count: u64,
    pub reconnect_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_average_latency() {
        let metrics = EventMetrics::new();
        metrics.record_publish(Duration::from_micros(100));
        metrics.record_publish(Duration::from_micros(300));
        metrics.record_publish_error();
        metrics.record_retry();
        metrics.record_dead_letter();

        let snap = metrics.snapshot();
        assert_eq!(snap.publish_count, 2);
        assert_eq!(snap.avg_publish_latency_us, 200);
        assert_eq!(snap.publish_errors, 1);
        assert_eq!(snap.retry_count, 1);
        assert_eq!(snap.dead_letter_count, 1);
        assert_eq!(snap.handled_count, 0);
    }

    #[test]
    fn test_reset() {
        let metrics = EventMetrics::new();
        metrics.record_handled();
        metrics.record_reconnect();
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serialization() {
        let json = serde_json::to_string(&EventMetrics::new().snapshot()).unwrap();
        assert!(json.contains("\"publishCount\":0"));
        assert!(json.contains("\"deadLetterCount\":0"));
        assert!(json.contains("\"avgPublishLatencyUs\":0"));
    }
}
