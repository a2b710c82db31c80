//! Liveness and readiness endpoints.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use state_store::KeyValueStore;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub consumer: bool,
    pub store: bool,
}

/// GET /health: the process is up.
pub async fn check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /ready: 200 once the consumer holds its partitions and the store answers.
pub async fn ready<S: KeyValueStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> (StatusCode, Json<ReadyResponse>) {
    let consumer = state.consumer_ready.load(Ordering::SeqCst);
    let store = match state.repository.store().ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "store ping failed");
            false
        }
    };

    let (code, status) = if consumer && store {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (
        code,
        Json(ReadyResponse {
            status,
            consumer,
            store,
        }),
    )
}
