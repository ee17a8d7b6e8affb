//! Performance benchmarks for integration-bus
//!
//! Run with: cargo bench

use integration_bus::registry::{DeliveryInfo, EventDispatcher};
use integration_bus::services::{MemoryUserService, UserCreatedHandler};
use integration_bus::{
    Envelope, EventBus, MemoryBroker, MemoryConfig, OutgoingMessage, SubscriptionRegistry,
    UserCreatedIntegrationEvent,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn user_event(i: usize) -> UserCreatedIntegrationEvent {
    UserCreatedIntegrationEvent::new(format!("user-{}", i), "Ada", "Lovelace")
}

fn bench_envelope_serialization(c: &mut Criterion) {
    let envelope = Envelope::new(user_event(1));

    c.bench_function("OutgoingMessage::from_envelope", |b| {
        b.iter(|| OutgoingMessage::from_envelope(&envelope).unwrap());
    });

    let bytes = serde_json::to_vec(&envelope).unwrap();
    c.bench_function("Envelope deserialize", |b| {
        b.iter(|| serde_json::from_slice::<Envelope<UserCreatedIntegrationEvent>>(&bytes).unwrap());
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let bus = EventBus::new(MemoryBroker::new(MemoryConfig { max_published: 0 }));

    c.bench_function("MemoryBroker publish", |b| {
        b.to_async(&rt)
            .iter(|| async { bus.publish(user_event(1)).await.unwrap() });
    });
}

fn bench_memory_publish_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("publish_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{} events", count), |b| {
            b.to_async(&rt).iter(|| async {
                let bus = EventBus::new(MemoryBroker::new(MemoryConfig { max_published: 0 }));
                for i in 0..count {
                    bus.publish(user_event(i)).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let users = Arc::new(MemoryUserService::new());
    let mut registry = SubscriptionRegistry::new();
    registry
        .register::<UserCreatedIntegrationEvent, _>(UserCreatedHandler::new(users))
        .unwrap();
    let dispatcher = registry.resolve("UserCreatedIntegrationEvent").unwrap();

    // Same user every time: measures the idempotent "already exists" path
    let body = serde_json::to_vec(&Envelope::new(user_event(1))).unwrap();
    let cancel = CancellationToken::new();

    c.bench_function("dispatch (duplicate delivery)", |b| {
        b.to_async(&rt).iter(|| async {
            dispatcher
                .dispatch(
                    &body,
                    DeliveryInfo {
                        routing_key: "UserCreatedIntegrationEvent".to_string(),
                        attempt: 2,
                        max_attempts: 10,
                        cancel: cancel.clone(),
                    },
                )
                .await
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_envelope_serialization,
    bench_memory_publish,
    bench_memory_publish_throughput,
    bench_dispatch,
);
criterion_main!(benches);
