//! Health and metrics handlers (unauthenticated).

use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use super::super::error::ApiResult;
use super::super::state::AppState;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// GET /metrics — pool counters and runner stats as JSON.
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let pool = match &state.pool {
        Some(pool) => Some(pool.metrics().await),
        None => None,
    };
    let runners = state
        .registry
        .list()
        .await
        .map_err(|e| super::super::error::ApiError::internal(e.to_string()))?;
    let live = state
        .registry
        .live_runners()
        .await
        .map_err(|e| super::super::error::ApiError::internal(e.to_string()))?
        .len();

    Ok(Json(json!({
        "pool": pool,
        "runners": {
            "registered": runners.len(),
            "live": live,
        },
    })))
}
