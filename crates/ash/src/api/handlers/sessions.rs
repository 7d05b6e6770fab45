//! Session lifecycle and message streaming handlers.

use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, Query, State},
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use super::super::error::{ApiError, ApiResult};
use super::super::sse::sse_response;
use super::super::state::AppState;
use crate::auth::CurrentTenant;
use crate::session::CreateSessionOptions;
use crate::store::models::SessionStatus;
use crate::store::{EventFilter, SessionFilter};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub startup_script: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub include_partial_messages: bool,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecBody {
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CursorQuery {
    #[serde(default)]
    pub after: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let opts = CreateSessionOptions {
        model: request.model,
        env: request.env,
        startup_script: request.startup_script,
    };
    let session = state
        .sessions
        .create_session(&tenant.0, &request.agent, opts)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "session": session }))))
}

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<SessionStatus>()
                .map_err(ApiError::bad_request)?,
        ),
        None => None,
    };
    let filter = SessionFilter {
        agent: query.agent,
        status,
        limit: query.limit,
        offset: query.offset,
    };
    let sessions = state.sessions.list_sessions(&tenant.0, &filter).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// GET /api/sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.sessions.get_session(&tenant.0, &id).await?;
    Ok(Json(json!({ "session": session })))
}

/// POST /api/sessions/{id}/pause
pub async fn pause_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.sessions.pause_session(&tenant.0, &id).await?;
    Ok(Json(json!({ "session": session })))
}

/// POST /api/sessions/{id}/resume
pub async fn resume_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.sessions.resume_session(&tenant.0, &id).await?;
    Ok(Json(json!({ "session": session })))
}

/// POST /api/sessions/{id}/stop
pub async fn stop_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.sessions.stop_session(&tenant.0, &id).await?;
    Ok(Json(json!({ "session": session })))
}

/// POST /api/sessions/{id}/fork
pub async fn fork_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.sessions.fork_session(&tenant.0, &id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "session": session }))))
}

/// DELETE /api/sessions/{id} — ends the session (terminal).
pub async fn end_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.sessions.end_session(&tenant.0, &id).await?;
    Ok(Json(json!({ "session": session })))
}

/// POST /api/sessions/{id}/messages — SSE stream.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Response<Body>> {
    if request.content.is_empty() {
        return Err(ApiError::bad_request("content must not be empty"));
    }
    let stream = state
        .sessions
        .send_message(
            &tenant.0,
            &id,
            request.content,
            request.include_partial_messages,
            request.model,
        )
        .await?;
    Ok(sse_response(stream))
}

/// GET /api/sessions/{id}/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
    Query(query): Query<CursorQuery>,
) -> ApiResult<impl IntoResponse> {
    let messages = state
        .sessions
        .list_messages(&tenant.0, &id, query.after, query.limit)
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

/// GET /api/sessions/{id}/events
pub async fn list_events(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
    Query(query): Query<CursorQuery>,
) -> ApiResult<impl IntoResponse> {
    let event_type = match query.event_type.as_deref() {
        Some(t) => Some(t.parse().map_err(ApiError::bad_request)?),
        None => None,
    };
    let filter = EventFilter {
        event_type,
        after_sequence: query.after,
        limit: query.limit,
    };
    let events = state.sessions.list_events(&tenant.0, &id, &filter).await?;
    Ok(Json(json!({ "events": events })))
}

/// GET /api/sessions/{id}/logs
pub async fn list_logs(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
    Query(query): Query<CursorQuery>,
) -> ApiResult<impl IntoResponse> {
    let logs = state.sessions.list_logs(&tenant.0, &id, query.after).await?;
    Ok(Json(json!({ "logs": logs })))
}

/// POST /api/sessions/{id}/exec
pub async fn exec(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
    Json(request): Json<ExecBody>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .sessions
        .exec(
            &tenant.0,
            &id,
            &request.command,
            request.timeout_ms.map(Duration::from_millis),
        )
        .await?;
    Ok(Json(outcome))
}
