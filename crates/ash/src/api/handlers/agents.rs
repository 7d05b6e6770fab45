//! Agent management handlers.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use super::super::error::{ApiError, ApiResult};
use super::super::state::AppState;
use crate::agent::AgentSource;
use crate::auth::CurrentTenant;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployAgentRequest {
    pub name: String,
    /// Server-local directory to copy the bundle from.
    #[serde(default)]
    pub path: Option<String>,
    /// Uploaded bundle as base64 tar.gz.
    #[serde(default)]
    pub bundle_b64: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeployAgentRequest {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub bundle_b64: Option<String>,
}

fn source_from(path: Option<String>, bundle_b64: Option<String>) -> ApiResult<AgentSource> {
    match (path, bundle_b64) {
        (Some(path), None) => Ok(AgentSource::LocalPath(path.into())),
        (None, Some(bundle)) => Ok(AgentSource::Bundle(bundle)),
        _ => Err(ApiError::bad_request(
            "exactly one of `path` or `bundleB64` is required",
        )),
    }
}

/// POST /api/agents
pub async fn deploy_agent(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Json(request): Json<DeployAgentRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = source_from(request.path, request.bundle_b64)?;
    let agent = state.agents.deploy(&tenant.0, &request.name, source).await?;
    Ok((StatusCode::CREATED, Json(json!({ "agent": agent }))))
}

/// GET /api/agents
pub async fn list_agents(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
) -> ApiResult<impl IntoResponse> {
    let agents = state.agents.list(&tenant.0).await?;
    Ok(Json(json!({ "agents": agents })))
}

/// GET /api/agents/{name}
pub async fn get_agent(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agent = state
        .agents
        .get(&tenant.0, &name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent {}", name)))?;
    Ok(Json(json!({ "agent": agent })))
}

/// PATCH /api/agents/{name}
pub async fn redeploy_agent(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(name): Path<String>,
    Json(request): Json<RedeployAgentRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = source_from(request.path, request.bundle_b64)?;
    let agent = state.agents.redeploy(&tenant.0, &name, source).await?;
    Ok(Json(json!({ "agent": agent })))
}

/// DELETE /api/agents/{name}
pub async fn delete_agent(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.agents.delete(&tenant.0, &name).await?;
    Ok(Json(json!({ "deleted": true, "name": name })))
}

/// GET /api/agents/{name}/files
pub async fn list_agent_files(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let files = state.agents.list_files(&tenant.0, &name).await?;
    Ok(Json(json!({ "files": files })))
}

/// GET /api/agents/{name}/files/{*path}
pub async fn read_agent_file(
    State(state): State<AppState>,
    Extension(tenant): Extension<CurrentTenant>,
    Path((name, path)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let content = state.agents.read_file(&tenant.0, &name, &path).await?;
    Ok(content)
}
