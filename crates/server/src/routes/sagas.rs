//! Operator endpoints for inspecting and purging sagas.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::SagaId;
use saga::{SagaState, SagaStatus};
use serde::{Deserialize, Serialize};
use state_store::KeyValueStore;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct SagaListResponse {
    pub status: SagaStatus,
    pub count: usize,
    pub sagas: Vec<SagaState>,
}

fn parse_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid saga id: {id}")))
}

/// GET /sagas/{id}: the stored saga.
pub async fn get<S: KeyValueStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaState>, ApiError> {
    let id = parse_id(&id)?;
    let saga = state.repository.get(id).await?;
    Ok(Json(saga))
}

/// GET /sagas?status=<status>: every saga currently in `status`.
pub async fn list<S: KeyValueStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<SagaListResponse>, ApiError> {
    let raw = query
        .status
        .ok_or_else(|| ApiError::BadRequest("status query parameter is required".to_string()))?;
    let status: SagaStatus = raw
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown saga status: {raw}")))?;

    let sagas = state.repository.list_by_status(status).await?;
    Ok(Json(SagaListResponse {
        status,
        count: sagas.len(),
        sagas,
    }))
}

/// DELETE /sagas/{id}: removes the saga record without compensating.
pub async fn delete<S: KeyValueStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    if state.repository.delete(id).await? {
        tracing::warn!(saga_id = %id, "saga purged by operator");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("saga not found: {id}")))
    }
}
