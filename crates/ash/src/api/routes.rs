//! Route table for the coordinator HTTP surface.

use axum::{
    Router, middleware,
    routing::{delete, get, patch, post},
};
use tower_http::trace::TraceLayer;

use super::handlers::{agents, files, internal, misc, sessions};
use super::state::AppState;
use crate::auth::{auth_middleware, internal_auth_middleware};

/// Build the full coordinator router.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Agents
        .route("/agents", post(agents::deploy_agent))
        .route("/agents", get(agents::list_agents))
        .route("/agents/{name}", get(agents::get_agent))
        .route("/agents/{name}", patch(agents::redeploy_agent))
        .route("/agents/{name}", delete(agents::delete_agent))
        .route("/agents/{name}/files", get(agents::list_agent_files))
        .route("/agents/{name}/files/{*path}", get(agents::read_agent_file))
        // Sessions
        .route("/sessions", post(sessions::create_session))
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/{id}", get(sessions::get_session))
        .route("/sessions/{id}", delete(sessions::end_session))
        .route("/sessions/{id}/pause", post(sessions::pause_session))
        .route("/sessions/{id}/resume", post(sessions::resume_session))
        .route("/sessions/{id}/stop", post(sessions::stop_session))
        .route("/sessions/{id}/fork", post(sessions::fork_session))
        // Messages & history
        .route("/sessions/{id}/messages", post(sessions::send_message))
        .route("/sessions/{id}/messages", get(sessions::list_messages))
        .route("/sessions/{id}/events", get(sessions::list_events))
        .route("/sessions/{id}/logs", get(sessions::list_logs))
        // Files
        .route("/sessions/{id}/files", get(files::list_files))
        .route("/sessions/{id}/files", post(files::write_file))
        .route("/sessions/{id}/files/{*path}", get(files::read_file))
        .route("/sessions/{id}/files/{*path}", delete(files::delete_file))
        // Exec
        .route("/sessions/{id}/exec", post(sessions::exec))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth_middleware,
        ));

    let internal_api = Router::new()
        .route("/runners/register", post(internal::register_runner))
        .route("/runners/heartbeat", post(internal::heartbeat_runner))
        .route("/runners", get(internal::list_runners))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            internal_auth_middleware,
        ));

    // The internal nest is added after the auth layer, so it is guarded by
    // the shared secret only.
    let api = api.nest("/internal", internal_api);

    Router::new()
        .route("/health", get(misc::health))
        .route("/metrics", get(misc::metrics))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
