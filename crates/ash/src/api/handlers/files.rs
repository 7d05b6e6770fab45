//! Session workspace file handlers.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use super::super::error::{ApiError, ApiResult};
use super::super::state::AppState;
use crate::auth::CurrentTenant;
use crate::runner::wire::FILE_SOURCE_HEADER;
use crate::session::FileSource;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutFileRequest {
    pub path: String,
    pub content_base64: String,
}

fn source_tag(source: FileSource) -> &'static str {
    match source {
        FileSource::Sandbox => "sandbox",
        FileSource::Snapshot => "snapshot",
    }
}

/// GET /api/sessions/{id}/files
pub async fn list_files(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let listing = state.sessions.list_files(&tenant.0, &id).await?;
    Ok(Json(json!({
        "source": source_tag(listing.source),
        "files": listing.entries,
    })))
}

/// GET /api/sessions/{id}/files/{*path}
pub async fn read_file(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path((id, path)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let file = state.sessions.read_file(&tenant.0, &id, &path).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (
                header::HeaderName::from_static(FILE_SOURCE_HEADER),
                source_tag(file.source),
            ),
        ],
        file.content,
    ))
}

/// POST /api/sessions/{id}/files
pub async fn write_file(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(id): Path<String>,
    Json(request): Json<PutFileRequest>,
) -> ApiResult<impl IntoResponse> {
    let content = BASE64
        .decode(&request.content_base64)
        .map_err(|e| ApiError::bad_request(format!("invalid base64 content: {}", e)))?;
    state
        .sessions
        .write_file(&tenant.0, &id, &request.path, &content)
        .await?;
    Ok(Json(json!({ "written": request.path })))
}

/// DELETE /api/sessions/{id}/files/{*path}
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path((id, path)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.sessions.delete_file(&tenant.0, &id, &path).await?;
    Ok(Json(json!({ "deleted": path })))
}
