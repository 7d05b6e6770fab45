//! Runner-side internal API.
//!
//! The mirror of the session sandbox operations, served by `ash runner`
//! and called by the coordinator's `RemoteHost`. Auth is the shared
//! internal secret; the query route tunnels bridge events as chunked
//! NDJSON so backpressure propagates end-to-end.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Response, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use ash_protocol::codec;

use super::error::{ApiError, ApiResult};
use crate::auth::{AuthState, internal_auth_middleware};
use crate::runner::wire::{
    AliveResponse, CreateSandboxRequest, ExecRequest, FILE_SOURCE_HEADER, WriteFileRequest,
    unpack_bundle,
};
use crate::sandbox::pool::SandboxPool;
use crate::session::node::{HostCreateOptions, LocalHost, QuerySpec, SandboxHost};
use crate::session::FileSource;

/// State for the runner's internal app.
#[derive(Clone)]
pub struct RunnerApiState {
    pub host: Arc<LocalHost>,
    pub pool: Arc<SandboxPool>,
    pub store: crate::store::SharedStore,
    pub agents_dir: PathBuf,
    pub auth: AuthState,
}

/// Build the runner's internal router.
pub fn create_runner_router(state: RunnerApiState) -> Router {
    let sessions = Router::new()
        .route("/sessions/{id}/sandbox", post(create_sandbox))
        .route("/sessions/{id}/sandbox", delete(destroy_sandbox))
        .route("/sessions/{id}/alive", get(alive))
        .route("/sessions/{id}/query", post(query))
        .route("/sessions/{id}/interrupt", post(interrupt))
        .route("/sessions/{id}/exec", post(exec))
        .route("/sessions/{id}/release", post(release))
        .route("/sessions/{id}/snapshot", post(snapshot))
        .route("/sessions/{id}/files", get(list_files))
        .route("/sessions/{id}/files", post(write_file))
        .route("/sessions/{id}/files/{*path}", get(read_file))
        .route("/sessions/{id}/files/{*path}", delete(delete_file))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            internal_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/api/internal", sessions)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<RunnerApiState>) -> impl IntoResponse {
    let metrics = state.pool.metrics().await;
    Json(json!({ "status": "ok", "pool": metrics }))
}

/// POST /api/internal/sessions/{id}/sandbox
async fn create_sandbox(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
    Json(request): Json<CreateSandboxRequest>,
) -> ApiResult<impl IntoResponse> {
    // Materialize the shipped agent bundle under this runner's data dir.
    let agent_dir = state
        .agents_dir
        .join(&request.tenant_id)
        .join(&request.agent_name);
    let bundle = request.agent_bundle_b64;
    let dir = agent_dir.clone();
    tokio::task::spawn_blocking(move || {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        unpack_bundle(&bundle, &dir)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(|e| ApiError::bad_request(format!("invalid agent bundle: {}", e)))?;

    let workspace_bundle = match request.workspace_bundle_b64 {
        Some(b64) => Some(
            BASE64
                .decode(&b64)
                .map_err(|e| ApiError::bad_request(format!("invalid workspace bundle: {}", e)))?,
        ),
        None => None,
    };

    let opts = HostCreateOptions {
        session_id: id.clone(),
        tenant_id: request.tenant_id,
        agent_name: request.agent_name,
        agent_dir,
        credential_env: request.credential_env,
        extra_env: request.extra_env,
        startup_script: request.startup_script,
        restore_snapshot: request.restore_snapshot,
        workspace_bundle,
    };
    state.host.acquire(opts).await?;
    Ok((StatusCode::CREATED, Json(json!({ "sandboxId": id }))))
}

/// DELETE /api/internal/sessions/{id}/sandbox
async fn destroy_sandbox(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.host.destroy(&id).await?;
    Ok(Json(json!({ "destroyed": id })))
}

/// GET /api/internal/sessions/{id}/alive
async fn alive(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(AliveResponse {
        alive: state.host.is_warm(&id).await,
    })
}

/// POST /api/internal/sessions/{id}/query — chunked NDJSON tunnel.
async fn query(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
    Json(spec): Json<QuerySpec>,
) -> ApiResult<Response<Body>> {
    let mut events = state.host.query(&id, spec).await?;

    let body = Body::from_stream(async_stream::stream! {
        while let Some(event) = events.next().await {
            match codec::encode(&event) {
                Ok(line) => yield Ok::<_, std::convert::Infallible>(line),
                Err(e) => {
                    log::warn!("Tunnel frame encode failed: {:?}", e);
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// POST /api/internal/sessions/{id}/interrupt
async fn interrupt(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.host.interrupt(&id).await?;
    Ok(Json(json!({ "interrupted": id })))
}

/// POST /api/internal/sessions/{id}/exec
async fn exec(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .host
        .exec(
            &id,
            &request.command,
            request.timeout_ms.map(Duration::from_millis),
        )
        .await?;
    Ok(Json(outcome))
}

/// POST /api/internal/sessions/{id}/release
async fn release(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.host.release(&id).await?;
    Ok(Json(json!({ "released": id })))
}

/// POST /api/internal/sessions/{id}/snapshot — returns the packed snapshot.
async fn snapshot(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
) -> ApiResult<Response<Body>> {
    // Agent name only labels the metadata sidecar.
    let agent_name = state
        .store
        .get_sandbox(&id)
        .await
        .ok()
        .flatten()
        .map(|r| r.agent_name)
        .unwrap_or_default();
    let archive = state.host.snapshot_archive(&id, &agent_name).await?;

    match archive {
        Some(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/gzip")
            .body(Body::from(bytes))
            .map_err(|e| ApiError::internal(e.to_string())),
        None => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .map_err(|e| ApiError::internal(e.to_string())),
    }
}

/// GET /api/internal/sessions/{id}/files
async fn list_files(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let listing = state.host.list_files(&id).await?;
    Ok(Json(json!({
        "source": listing.source,
        "entries": listing.entries,
    })))
}

/// GET /api/internal/sessions/{id}/files/{*path}
async fn read_file(
    State(state): State<RunnerApiState>,
    Path((id, path)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let file = state.host.read_file(&id, &path).await?;
    let source = match file.source {
        FileSource::Sandbox => "sandbox",
        FileSource::Snapshot => "snapshot",
    };
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::HeaderName::from_static(FILE_SOURCE_HEADER), source),
        ],
        file.content,
    ))
}

/// POST /api/internal/sessions/{id}/files
async fn write_file(
    State(state): State<RunnerApiState>,
    Path(id): Path<String>,
    Json(request): Json<WriteFileRequest>,
) -> ApiResult<impl IntoResponse> {
    let content = BASE64
        .decode(&request.content_base64)
        .map_err(|e| ApiError::bad_request(format!("invalid base64 content: {}", e)))?;
    state.host.write_file(&id, &request.path, &content).await?;
    Ok(Json(json!({ "written": request.path })))
}

/// DELETE /api/internal/sessions/{id}/files/{*path}
async fn delete_file(
    State(state): State<RunnerApiState>,
    Path((id, path)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.host.delete_file(&id, &path).await?;
    Ok(Json(json!({ "deleted": path })))
}
