//! User deletion saga orchestrator service.
//!
//! Wires the saga engine to a state store and a message bus, runs the
//! consumer, timeout monitor and store janitor, and serves health,
//! readiness, Prometheus metrics and operator endpoints over HTTP.

pub mod config;
pub mod error;
pub mod janitor;
pub mod routes;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::SagaRepository;
use state_store::KeyValueStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP handlers.
pub struct AppState<S> {
    pub repository: SagaRepository<S>,
    /// Raised by the event consumer once it holds every partition.
    pub consumer_ready: Arc<AtomicBool>,
}

impl<S: KeyValueStore> AppState<S> {
    pub fn new(repository: SagaRepository<S>, consumer_ready: Arc<AtomicBool>) -> Self {
        Self {
            repository,
            consumer_ready,
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: KeyValueStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/ready", get(routes::health::ready::<S>))
        .route("/sagas", get(routes::sagas::list::<S>))
        .route(
            "/sagas/{id}",
            get(routes::sagas::get::<S>).delete(routes::sagas::delete::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
