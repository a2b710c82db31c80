//! Saga orchestrator entry point.

use std::sync::Arc;
use std::time::Duration;

use messaging::{InMemoryMessageBus, MessageBus, NatsBusConfig, NatsMessageBus};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    EventConsumer, EventPublisher, Orchestrator, Pipeline, SagaRepository, TimeoutMonitor,
};
use server::config::{AppEnv, BusBackend, Config, StoreBackend};
use server::{AppState, create_app, janitor};
use sqlx::postgres::PgPoolOptions;
use state_store::{InMemoryKeyValueStore, KeyValueStore, PostgresKeyValueStore};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(app_env: AppEnv, log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if app_env.json_logs() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env()?;
    init_tracing(config.app_env, &config.log_level);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let store = match &config.store {
        StoreBackend::Memory => Store::Memory(InMemoryKeyValueStore::new()),
        StoreBackend::Postgres {
            url,
            max_connections,
        } => {
            let pool = PgPoolOptions::new()
                .max_connections(*max_connections)
                .connect(url)
                .await?;
            let store = PostgresKeyValueStore::new(pool);
            store.run_migrations().await?;
            Store::Postgres(store)
        }
    };

    let bus = match &config.bus {
        BusBackend::Memory => Bus::Memory(InMemoryMessageBus::with_options(
            config.bus_partitions,
            config.consumer.offset_reset,
            config.redelivery_delay,
        )),
        BusBackend::Nats { url } => Bus::Nats(
            NatsMessageBus::connect(NatsBusConfig {
                url: url.clone(),
                partitions: config.bus_partitions,
                offset_reset: config.consumer.offset_reset,
                // Long enough that only a crashed worker triggers redelivery
                ack_wait: config.consumer.max_processing_time + Duration::from_secs(30),
                redelivery_delay: config.redelivery_delay,
                ..NatsBusConfig::default()
            })
            .await?,
        ),
    };

    tracing::info!(
        app_env = ?config.app_env,
        store = config.store.name(),
        bus = config.bus.name(),
        "backends connected"
    );

    match (store, bus) {
        (Store::Memory(s), Bus::Memory(b)) => run(config, s, b, metrics_handle).await,
        (Store::Memory(s), Bus::Nats(b)) => run(config, s, b, metrics_handle).await,
        (Store::Postgres(s), Bus::Memory(b)) => run(config, s, b, metrics_handle).await,
        (Store::Postgres(s), Bus::Nats(b)) => run(config, s, b, metrics_handle).await,
    }
}

enum Store {
    Memory(InMemoryKeyValueStore),
    Postgres(PostgresKeyValueStore),
}

enum Bus {
    Memory(InMemoryMessageBus),
    Nats(NatsMessageBus),
}

async fn run<S, B>(
    config: Config,
    store: S,
    bus: B,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError>
where
    S: KeyValueStore + Clone + 'static,
    B: MessageBus + 'static,
{
    let bus = Arc::new(bus);
    let pipeline = Pipeline::user_deletion(config.saga.step_timeout);
    let topics = pipeline.inbound_topics();

    let orchestrator = Arc::new(Orchestrator::new(
        SagaRepository::new(store.clone(), config.saga.retention, config.saga.scan_page_size),
        EventPublisher::new(bus.clone(), config.publisher.clone()),
        pipeline,
        config.saga.clone(),
    ));

    let consumer = EventConsumer::new(
        bus.clone(),
        orchestrator.clone(),
        topics,
        config.consumer.clone(),
    );
    let state = Arc::new(AppState::new(
        SagaRepository::new(store.clone(), config.saga.retention, config.saga.scan_page_size),
        consumer.ready_flag(),
    ));
    let monitor = TimeoutMonitor::new(orchestrator.clone(), config.saga.cleanup_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let consumer_rx = shutdown_rx.clone();
    tasks.spawn(async move {
        if let Err(e) = consumer.run(consumer_rx).await {
            tracing::error!(error = %e, "event consumer failed");
        }
    });
    tasks.spawn(monitor.run(shutdown_rx.clone()));
    tasks.spawn(janitor::run(
        store,
        config.saga.cleanup_interval,
        shutdown_rx.clone(),
    ));

    let app = create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting saga orchestrator");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let mut server_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "background task panicked");
            }
        }
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "server error"),
            Err(e) => tracing::error!(error = %e, "server task panicked"),
        }
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        tracing::warn!(grace = ?config.shutdown_grace, "shutdown grace period elapsed, exiting");
    }

    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "failed to close message bus");
    }
    tracing::info!("saga orchestrator shut down");
    Ok(())
}
