//! Internal coordinator routes: runner registration and heartbeat.
//!
//! Authenticated with the shared internal secret, never with API keys.

use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use super::super::error::{ApiError, ApiResult};
use super::super::state::AppState;
use crate::runner::wire::{HeartbeatRequest, RegisterRequest};

/// POST /api/internal/runners/register
pub async fn register_runner(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.max_sandboxes <= 0 {
        return Err(ApiError::bad_request("maxSandboxes must be positive"));
    }
    let runner = state
        .registry
        .register(
            &request.id,
            &request.host,
            request.port,
            request.max_sandboxes,
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "runner": runner })))
}

/// POST /api/internal/runners/heartbeat
pub async fn heartbeat_runner(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .registry
        .heartbeat(&request.id, request.active_count, request.warming_count)
        .await
        .map_err(|e| match e {
            crate::store::StoreError::NotFound(what) => ApiError::not_found(what),
            other => ApiError::internal(other.to_string()),
        })?;
    Ok(Json(json!({ "ok": true })))
}

/// GET /api/internal/runners
pub async fn list_runners(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let runners = state
        .registry
        .list()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "runners": runners })))
}
