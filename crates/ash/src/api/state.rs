//! Application state shared across handlers.

use std::sync::Arc;

use crate::agent::AgentService;
use crate::auth::AuthState;
use crate::runner::registry::RunnerRegistry;
use crate::sandbox::pool::SandboxPool;
use crate::session::SessionService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session orchestrator.
    pub sessions: Arc<SessionService>,
    /// Agent bundle management.
    pub agents: Arc<AgentService>,
    /// Runner registration and selection.
    pub registry: Arc<RunnerRegistry>,
    /// Local sandbox pool (absent in pure-coordinator mode).
    pub pool: Option<Arc<SandboxPool>>,
    /// Authentication state.
    pub auth: AuthState,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionService>,
        agents: Arc<AgentService>,
        registry: Arc<RunnerRegistry>,
        pool: Option<Arc<SandboxPool>>,
        auth: AuthState,
    ) -> Self {
        Self {
            sessions,
            agents,
            registry,
            pool,
            auth,
        }
    }
}
