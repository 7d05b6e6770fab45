//! Durable state storage.
//!
//! An abstract [`StateStore`] with two backends: an embedded single-file
//! SQLite engine and a networked Postgres engine. Placeholder and DDL
//! differences stay inside the implementations; timestamps are RFC 3339
//! TEXT generated in Rust so both dialects store the same values.

pub mod models;
mod postgres;
mod sqlite;

pub use models::*;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Query filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub agent: Option<String>,
    pub status: Option<SessionStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Query filter for timeline event listings.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub after_sequence: Option<i64>,
    pub limit: Option<i64>,
}

/// Abstract state store used by every higher layer.
///
/// Sequence allocation for messages and events is serialized per session by
/// the implementations (single-statement `max + 1` insert).
#[async_trait]
pub trait StateStore: Send + Sync {
    // -- Agents --

    /// Insert a new agent or bump the version of an existing `(tenant, name)`.
    async fn upsert_agent(&self, tenant_id: &str, name: &str, path: &str) -> StoreResult<Agent>;
    async fn get_agent(&self, tenant_id: &str, name: &str) -> StoreResult<Option<Agent>>;
    async fn list_agents(&self, tenant_id: &str) -> StoreResult<Vec<Agent>>;
    async fn delete_agent(&self, tenant_id: &str, name: &str) -> StoreResult<()>;

    // -- Sessions --

    async fn insert_session(&self, session: &Session) -> StoreResult<()>;
    async fn get_session(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Session>>;
    async fn list_sessions(&self, tenant_id: &str, filter: &SessionFilter)
        -> StoreResult<Vec<Session>>;
    async fn update_session_status(&self, id: &str, status: SessionStatus) -> StoreResult<()>;
    async fn touch_session(&self, id: &str) -> StoreResult<()>;
    async fn set_session_sandbox(&self, id: &str, sandbox_id: Option<&str>) -> StoreResult<()>;
    async fn set_session_runner(&self, id: &str, runner_id: Option<&str>) -> StoreResult<()>;

    /// Copy the parent's messages under a new session id with
    /// `parent_session_id` set. Atomic: either the child session and all
    /// copied messages land, or nothing does.
    async fn fork_session(&self, parent: &Session, child: &Session) -> StoreResult<()>;

    // -- Sandboxes --

    async fn insert_sandbox(&self, sandbox: &SandboxRecord) -> StoreResult<()>;
    async fn get_sandbox(&self, id: &str) -> StoreResult<Option<SandboxRecord>>;
    async fn list_sandboxes(&self) -> StoreResult<Vec<SandboxRecord>>;
    async fn list_sandboxes_by_state(&self, state: SandboxState)
        -> StoreResult<Vec<SandboxRecord>>;
    async fn set_sandbox_state(&self, id: &str, state: SandboxState) -> StoreResult<()>;
    async fn set_sandbox_pid(&self, id: &str, pid: Option<i64>) -> StoreResult<()>;
    async fn touch_sandbox(&self, id: &str) -> StoreResult<()>;
    /// Cold records whose `last_used_at` is older than the cutoff.
    async fn list_stale_cold_sandboxes(&self, cutoff: &str) -> StoreResult<Vec<SandboxRecord>>;
    async fn delete_sandbox(&self, id: &str) -> StoreResult<()>;

    // -- Messages --

    /// Append with the next per-session sequence. Returns the stored row.
    async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> StoreResult<Message>;
    async fn list_messages(
        &self,
        session_id: &str,
        after_sequence: Option<i64>,
        limit: Option<i64>,
    ) -> StoreResult<Vec<Message>>;

    // -- Timeline events --

    /// Append with the next per-session event sequence (independent of the
    /// message counter). Returns the stored row.
    async fn append_event(
        &self,
        session_id: &str,
        event_type: EventType,
        data: &str,
    ) -> StoreResult<SessionEvent>;
    async fn list_events(
        &self,
        session_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<Vec<SessionEvent>>;

    // -- Runners --

    async fn upsert_runner(&self, runner: &Runner) -> StoreResult<()>;
    async fn heartbeat_runner(
        &self,
        id: &str,
        active_count: i64,
        warming_count: i64,
    ) -> StoreResult<()>;
    async fn get_runner(&self, id: &str) -> StoreResult<Option<Runner>>;
    async fn list_runners(&self) -> StoreResult<Vec<Runner>>;

    // -- API keys --

    async fn upsert_api_key(&self, key: &ApiKey) -> StoreResult<()>;
    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>>;
}

/// Shared handle to a state store.
pub type SharedStore = Arc<dyn StateStore>;

/// Open a store from a database URL; the scheme selects the backend.
pub async fn open(database_url: &str) -> StoreResult<SharedStore> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresStore::connect(database_url).await?))
    } else {
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    }
}
