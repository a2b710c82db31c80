use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use messaging::InMemoryMessageBus;
use saga::{
    Event, EventPublisher, EventType, Orchestrator, Pipeline, PublisherConfig, SagaConfig,
    SagaRepository, SagaState, Service,
};
use state_store::InMemoryKeyValueStore;

fn orchestrator() -> Orchestrator<InMemoryKeyValueStore, InMemoryMessageBus> {
    let config = SagaConfig {
        retry_interval: Duration::ZERO,
        ..SagaConfig::default()
    };
    Orchestrator::new(
        SagaRepository::new(InMemoryKeyValueStore::new(), config.retention, 100),
        EventPublisher::new(
            Arc::new(InMemoryMessageBus::new(8)),
            PublisherConfig::default(),
        ),
        Pipeline::default(),
        config,
    )
}

fn bench_start_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = orchestrator();

    c.bench_function("saga/start", |b| {
        b.iter(|| {
            rt.block_on(async {
                orchestrator
                    .handle_event(&Event::deletion_requested("bench-user"))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_full_deletion(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/start_to_completed", |b| {
        b.iter(|| {
            rt.block_on(async {
                let orchestrator = orchestrator();
                let outcome = orchestrator
                    .handle_event(&Event::deletion_requested("bench-user"))
                    .await
                    .unwrap();
                let saga = outcome.saga().unwrap().clone();
                for service in Service::ALL {
                    let result =
                        Event::new(EventType::UserDeleted(service), "bench-user", Some(saga.id()));
                    orchestrator.handle_event(&result).await.unwrap();
                }
            });
        });
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let event = Event::new(
        EventType::UserDeleteFailed(Service::Board),
        "bench-user",
        Some(common::SagaId::new()),
    )
    .with_data("error", "board service unavailable");
    let payload = event.to_bytes().unwrap();

    c.bench_function("saga/event_decode", |b| {
        b.iter(|| Event::from_slice(&payload).unwrap());
    });
}

fn bench_state_serde(c: &mut Criterion) {
    let saga = SagaState::new("bench-user", Duration::from_secs(1800), chrono::Utc::now());

    c.bench_function("saga/state_json_roundtrip", |b| {
        b.iter(|| {
            let json = serde_json::to_string(&saga).unwrap();
            serde_json::from_str::<SagaState>(&json).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_start_saga,
    bench_full_deletion,
    bench_event_decode,
    bench_state_serde
);
criterion_main!(benches);
