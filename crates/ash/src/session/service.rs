//! Session service.
//!
//! Top-level orchestrator: session CRUD, message streaming, lifecycle
//! (pause/resume/stop/end/fork), exec, and file access. Every operation is
//! tenant-scoped and serialized on the session's lock; a streaming message
//! send holds the lock for its whole duration, so lifecycle verbs queue
//! behind it (after interrupting the in-flight query) and concurrent sends
//! bounce with `Busy`.

use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use ash_protocol::BridgeEvent;

use super::events::{classify, is_persisted_message};
use super::locks::SessionLocks;
use super::node::{
    FileContent, FileListing, FileSource, HostCreateOptions, HostError, QuerySpec, SandboxHost,
};
use super::router::HostRouter;
use crate::agent::{AgentError, AgentService};
use crate::sandbox::files as workspace_files;
use crate::sandbox::manager::ExecOutcome;
use crate::snapshot::SnapshotStore;
use crate::store::models::{
    EventType, Message, MessageRole, Session, SessionEvent, SessionStatus, now_rfc3339,
};
use crate::store::{EventFilter, SessionFilter, SharedStore, StoreError};

/// Session service failures, mapped onto HTTP statuses at the surface.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("session has ended: {0}")]
    Gone(String),

    #[error("a message is already streaming for this session")]
    Busy,

    #[error("sandbox capacity exceeded")]
    CapacityExceeded,

    #[error("no live runner available")]
    NoRunner,

    #[error("sandbox create failed: {0}")]
    CreateFailed(String),

    #[error("snapshot persistence failed: {0}")]
    Persistence(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    File(#[from] workspace_files::FileError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<HostError> for ServiceError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NotFound(what) => ServiceError::SessionNotFound(what),
            HostError::Busy => ServiceError::Busy,
            HostError::CapacityExceeded => ServiceError::CapacityExceeded,
            HostError::NoRunner => ServiceError::NoRunner,
            HostError::BridgeUnready(what) | HostError::CreateFailed(what) => {
                ServiceError::CreateFailed(what)
            }
            HostError::File(e) => ServiceError::File(e),
            HostError::Unreachable(what) => ServiceError::Internal(what),
            HostError::Internal(what) => ServiceError::Internal(what),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

/// Options accepted by `create_session`.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub model: Option<String>,
    pub env: HashMap<String, String>,
    pub startup_script: Option<String>,
}

/// One frame bound for the caller's SSE stream.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub name: String,
    pub data: Value,
}

/// The caller's end of a message stream.
pub struct MessageStream {
    pub rx: mpsc::Receiver<OutboundEvent>,
}

/// Top-level session orchestrator.
pub struct SessionService {
    store: SharedStore,
    snapshots: SnapshotStore,
    agents: Arc<AgentService>,
    router: Arc<HostRouter>,
    locks: SessionLocks,
    debug_timing: bool,
}

impl SessionService {
    pub fn new(
        store: SharedStore,
        snapshots: SnapshotStore,
        agents: Arc<AgentService>,
        router: Arc<HostRouter>,
        debug_timing: bool,
    ) -> Self {
        Self {
            store,
            snapshots,
            agents,
            router,
            locks: SessionLocks::new(),
            debug_timing,
        }
    }

    pub fn router(&self) -> &Arc<HostRouter> {
        &self.router
    }

    async fn lifecycle_event(&self, session_id: &str, op: &str) {
        let data = json!({ "op": op, "at": now_rfc3339() });
        if let Err(e) = self
            .store
            .append_event(session_id, EventType::Lifecycle, &data.to_string())
            .await
        {
            warn!("Lifecycle event append failed for {}: {}", session_id, e);
        }
    }

    async fn load(&self, tenant_id: &str, session_id: &str) -> Result<Session, ServiceError> {
        self.store
            .get_session(tenant_id, session_id)
            .await?
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    pub async fn get_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Session, ServiceError> {
        self.load(tenant_id, session_id).await
    }

    pub async fn list_sessions(
        &self,
        tenant_id: &str,
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, ServiceError> {
        Ok(self.store.list_sessions(tenant_id, filter).await?)
    }

    /// Create a session and its first sandbox.
    pub async fn create_session(
        &self,
        tenant_id: &str,
        agent_name: &str,
        opts: CreateSessionOptions,
    ) -> Result<Session, ServiceError> {
        let agent = self
            .agents
            .get(tenant_id, agent_name)
            .await?
            .ok_or_else(|| ServiceError::AgentNotFound(agent_name.to_string()))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let lock = self.locks.lock_for(&session_id);
        let _guard = lock.lock().await;

        let (runner_id, host) = self.router.select_home().await.map_err(ServiceError::from)?;

        let session = Session {
            id: session_id.clone(),
            tenant_id: tenant_id.to_string(),
            agent_name: agent_name.to_string(),
            sandbox_id: None,
            status: SessionStatus::Starting,
            runner_id: runner_id.clone(),
            parent_session_id: None,
            model: opts.model.clone(),
            created_at: now_rfc3339(),
            last_active_at: now_rfc3339(),
        };
        self.store.insert_session(&session).await?;
        self.lifecycle_event(&session_id, "created").await;

        let create = HostCreateOptions {
            session_id: session_id.clone(),
            tenant_id: tenant_id.to_string(),
            agent_name: agent_name.to_string(),
            agent_dir: std::path::PathBuf::from(&agent.path),
            credential_env: HashMap::new(),
            extra_env: opts.env,
            startup_script: opts.startup_script,
            restore_snapshot: false,
            workspace_bundle: None,
        };

        match host.acquire(create).await {
            Ok(()) => {
                self.store
                    .set_session_sandbox(&session_id, Some(&session_id))
                    .await?;
                self.store
                    .update_session_status(&session_id, SessionStatus::Active)
                    .await?;
                info!("Session {} active on {:?}", session_id, runner_id);
                self.load(tenant_id, &session_id).await
            }
            Err(e) => {
                self.store
                    .update_session_status(&session_id, SessionStatus::Error)
                    .await?;
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Message streaming
    // ========================================================================

    /// Stream one message round-trip. The returned channel yields raw
    /// `message` frames, granular classified frames, and a final `done`
    /// (or `error` then `done`).
    pub async fn send_message(
        &self,
        tenant_id: &str,
        session_id: &str,
        content: String,
        include_partial: bool,
        model_override: Option<String>,
    ) -> Result<MessageStream, ServiceError> {
        let lock = self.locks.lock_for(session_id);
        let guard = lock.try_lock_owned().map_err(|_| ServiceError::Busy)?;

        let session = self.load(tenant_id, session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(ServiceError::InvalidState(format!(
                "session is {}, not active",
                session.status
            )));
        }
        let sandbox_id = session
            .sandbox_id
            .clone()
            .ok_or_else(|| ServiceError::InvalidState("session has no sandbox".to_string()))?;

        let host = self
            .router
            .host_for(session.runner_id.as_deref())
            .await
            .map_err(ServiceError::from)?;

        // Persist the user turn before the query opens.
        let raw_user = json!({
            "type": "user",
            "message": { "role": "user", "content": content.clone() }
        });
        self.store
            .append_message(session_id, MessageRole::User, &raw_user.to_string())
            .await?;

        let spec = QuerySpec {
            session_id: session_id.to_string(),
            prompt: Some(content),
            include_partial_messages: include_partial,
            model: model_override.or(session.model.clone()),
        };
        let mut stream = host.query(&sandbox_id, spec).await.map_err(ServiceError::from)?;

        let (tx, rx) = mpsc::channel::<OutboundEvent>(64);
        let store = self.store.clone();
        let session_id = session_id.to_string();
        let debug_timing = self.debug_timing;

        tokio::spawn(async move {
            // Held for the whole turn: lifecycle ops queue, sends bounce.
            let _guard = guard;
            let started = tokio::time::Instant::now();
            let mut saw_terminal = false;
            let mut client_gone = false;

            // Forward one frame with a 30 s drain budget; on caller
            // disconnect or a stalled consumer, interrupt the bridge and
            // keep draining so persistence still completes.
            macro_rules! emit {
                ($name:expr, $data:expr) => {
                    if !client_gone
                        && tx
                            .send_timeout(
                                OutboundEvent {
                                    name: $name.to_string(),
                                    data: $data,
                                },
                                Duration::from_secs(30),
                            )
                            .await
                            .is_err()
                    {
                        client_gone = true;
                        debug!("Caller left stream for session {}, interrupting", session_id);
                        let _ = host.interrupt(&sandbox_id).await;
                    }
                };
            }

            while let Some(event) = stream.next().await {
                if debug_timing {
                    debug!(
                        "timing session={} +{}ms {:?}",
                        session_id,
                        started.elapsed().as_millis(),
                        std::mem::discriminant(&event)
                    );
                }
                match event {
                    BridgeEvent::Message { data } => {
                        if is_persisted_message(&data) {
                            if let Err(e) = store
                                .append_message(
                                    &session_id,
                                    MessageRole::Assistant,
                                    &data.to_string(),
                                )
                                .await
                            {
                                warn!("Message persist failed for {}: {}", session_id, e);
                            }
                        }

                        // Raw frame first, then the granular classification.
                        emit!("message", data.clone());
                        for ev in classify(&data) {
                            if let Some(ty) = ev.persist {
                                if let Err(e) = store
                                    .append_event(&session_id, ty, &ev.data.to_string())
                                    .await
                                {
                                    warn!("Event persist failed for {}: {}", session_id, e);
                                }
                            }
                            emit!(&ev.name, ev.data);
                        }
                    }
                    BridgeEvent::Error { error } => {
                        saw_terminal = true;
                        let data = json!({ "error": error });
                        let _ = store
                            .append_event(&session_id, EventType::Error, &data.to_string())
                            .await;
                        emit!("error", data);
                        emit!("done", json!({ "sessionId": session_id }));
                        // Upstream failure: the session stays active.
                    }
                    BridgeEvent::Done { .. } => {
                        saw_terminal = true;
                        emit!("done", json!({ "sessionId": session_id }));
                    }
                    BridgeEvent::Log { level, text, ts } => {
                        let data =
                            json!({ "op": "log", "level": level.to_string(), "text": text, "ts": ts });
                        let _ = store
                            .append_event(&session_id, EventType::Lifecycle, &data.to_string())
                            .await;
                        emit!("log", data);
                    }
                    BridgeEvent::Ready | BridgeEvent::ExecResult { .. } | BridgeEvent::Unknown => {}
                }
            }

            if !saw_terminal {
                // The bridge vanished mid-stream: fatal for the sandbox.
                warn!("Bridge lost mid-stream for session {}", session_id);
                let data = json!({ "error": "bridge connection lost" });
                let _ = store
                    .append_event(&session_id, EventType::Error, &data.to_string())
                    .await;
                let _ = store
                    .update_session_status(&session_id, SessionStatus::Error)
                    .await;
                emit!("error", data);
                emit!("done", json!({ "sessionId": session_id }));
            } else {
                let _ = store.touch_session(&session_id).await;
            }
        });

        Ok(MessageStream { rx })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Acquire the session lock, interrupting an in-flight query first so a
    /// streaming send cannot starve lifecycle ops.
    async fn lock_for_lifecycle(
        &self,
        session: &Session,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self.locks.lock_for(&session.id);
        match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                if let (Some(sandbox_id), Ok(host)) = (
                    session.sandbox_id.as_deref(),
                    self.router.host_for(session.runner_id.as_deref()).await,
                ) {
                    let _ = host.interrupt(sandbox_id).await;
                }
                lock.lock_owned().await
            }
        }
    }

    /// Pause: persist state, evict the sandbox, status `paused`.
    pub async fn pause_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Session, ServiceError> {
        let session = self.load(tenant_id, session_id).await?;
        let _guard = self.lock_for_lifecycle(&session).await;
        let session = self.load(tenant_id, session_id).await?;

        if session.status != SessionStatus::Active {
            return Err(ServiceError::InvalidState(format!(
                "cannot pause a {} session",
                session.status
            )));
        }

        self.release_sandbox(&session).await;
        self.store
            .update_session_status(session_id, SessionStatus::Paused)
            .await?;
        self.lifecycle_event(session_id, "paused").await;
        self.load(tenant_id, session_id).await
    }

    /// Stop: same persistence as pause, explicit user intent; resumable.
    pub async fn stop_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Session, ServiceError> {
        let session = self.load(tenant_id, session_id).await?;
        let _guard = self.lock_for_lifecycle(&session).await;
        let session = self.load(tenant_id, session_id).await?;

        if session.is_terminal() {
            return Err(ServiceError::Gone(session_id.to_string()));
        }
        if session.status != SessionStatus::Active {
            return Err(ServiceError::InvalidState(format!(
                "cannot stop a {} session",
                session.status
            )));
        }

        self.release_sandbox(&session).await;
        self.store
            .update_session_status(session_id, SessionStatus::Stopped)
            .await?;
        self.lifecycle_event(session_id, "stopped").await;
        self.load(tenant_id, session_id).await
    }

    /// Resume: warm reattach when the sandbox survived, cold re-create from
    /// snapshot otherwise. Idempotent on active sessions.
    pub async fn resume_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Session, ServiceError> {
        let session = self.load(tenant_id, session_id).await?;
        let _guard = self.lock_for_lifecycle(&session).await;
        let session = self.load(tenant_id, session_id).await?;

        match session.status {
            SessionStatus::Ended => return Err(ServiceError::Gone(session_id.to_string())),
            SessionStatus::Active => return Ok(session),
            SessionStatus::Starting => {
                return Err(ServiceError::InvalidState(
                    "session is still starting".to_string(),
                ));
            }
            SessionStatus::Paused | SessionStatus::Stopped | SessionStatus::Error => {}
        }

        let agent = self
            .agents
            .get(tenant_id, &session.agent_name)
            .await?
            .ok_or_else(|| ServiceError::AgentNotFound(session.agent_name.clone()))?;

        // Prefer the session's current home; reassign when the runner died.
        let (runner_id, host) = match self.router.host_for(session.runner_id.as_deref()).await {
            Ok(host) => (session.runner_id.clone(), host),
            Err(HostError::NoRunner) => {
                let (runner_id, host) =
                    self.router.select_home().await.map_err(ServiceError::from)?;
                info!(
                    "Session {} reassigned from {:?} to {:?}",
                    session_id, session.runner_id, runner_id
                );
                (runner_id, host)
            }
            Err(e) => return Err(e.into()),
        };

        let create = HostCreateOptions {
            session_id: session_id.to_string(),
            tenant_id: tenant_id.to_string(),
            agent_name: session.agent_name.clone(),
            agent_dir: std::path::PathBuf::from(&agent.path),
            credential_env: HashMap::new(),
            extra_env: HashMap::new(),
            startup_script: None,
            restore_snapshot: true,
            workspace_bundle: None,
        };
        host.acquire(create).await.map_err(ServiceError::from)?;

        self.store
            .set_session_runner(session_id, runner_id.as_deref())
            .await?;
        self.store
            .set_session_sandbox(session_id, Some(session_id))
            .await?;
        self.store
            .update_session_status(session_id, SessionStatus::Active)
            .await?;
        self.lifecycle_event(session_id, "resumed").await;
        self.load(tenant_id, session_id).await
    }

    /// End: destroy the sandbox; the snapshot remains for audit. Terminal.
    pub async fn end_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Session, ServiceError> {
        let session = self.load(tenant_id, session_id).await?;
        let _guard = self.lock_for_lifecycle(&session).await;
        let session = self.load(tenant_id, session_id).await?;

        if session.is_terminal() {
            return Ok(session);
        }

        if let Some(sandbox_id) = session.sandbox_id.as_deref() {
            match self.router.host_for(session.runner_id.as_deref()).await {
                Ok(host) => {
                    // Capture a final snapshot for audit before teardown.
                    let _ = host.snapshot_archive(sandbox_id, &session.agent_name).await;
                    if let Err(e) = host.destroy(sandbox_id).await {
                        warn!("Sandbox destroy on end of {} failed: {}", session_id, e);
                    }
                }
                Err(e) => debug!("No host to destroy sandbox of {}: {}", session_id, e),
            }
        }

        self.store.set_session_sandbox(session_id, None).await?;
        self.store
            .update_session_status(session_id, SessionStatus::Ended)
            .await?;
        self.lifecycle_event(session_id, "ended").await;
        self.load(tenant_id, session_id).await
    }

    /// Fork: new session with the parent's messages and a copy of the
    /// parent's current workspace; the parent is untouched. Snapshot
    /// failure is fatal here (durability is the point of a fork).
    pub async fn fork_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Session, ServiceError> {
        let parent = self.load(tenant_id, session_id).await?;
        let _guard = self.lock_for_lifecycle(&parent).await;
        let parent = self.load(tenant_id, session_id).await?;

        let agent = self
            .agents
            .get(tenant_id, &parent.agent_name)
            .await?
            .ok_or_else(|| ServiceError::AgentNotFound(parent.agent_name.clone()))?;

        // Capture the parent's current workspace.
        let archive = match self.router.host_for(parent.runner_id.as_deref()).await {
            Ok(host) => host
                .snapshot_archive(&parent.id, &parent.agent_name)
                .await
                .map_err(ServiceError::from)?,
            // Dead runner: fall back to any snapshot the coordinator holds.
            Err(HostError::NoRunner) => self.snapshots.export_archive(&parent.id).await,
            Err(e) => return Err(e.into()),
        };
        let archive = archive.ok_or_else(|| {
            ServiceError::Persistence(format!("no workspace snapshot for {}", parent.id))
        })?;

        let child_id = uuid::Uuid::new_v4().to_string();
        let (runner_id, host) = self.router.select_home().await.map_err(ServiceError::from)?;

        let child = Session {
            id: child_id.clone(),
            tenant_id: tenant_id.to_string(),
            agent_name: parent.agent_name.clone(),
            sandbox_id: None,
            status: SessionStatus::Starting,
            runner_id: runner_id.clone(),
            parent_session_id: Some(parent.id.clone()),
            model: parent.model.clone(),
            created_at: now_rfc3339(),
            last_active_at: now_rfc3339(),
        };
        self.store.fork_session(&parent, &child).await?;
        self.lifecycle_event(&child_id, "forked").await;

        let create = HostCreateOptions {
            session_id: child_id.clone(),
            tenant_id: tenant_id.to_string(),
            agent_name: parent.agent_name.clone(),
            agent_dir: std::path::PathBuf::from(&agent.path),
            credential_env: HashMap::new(),
            extra_env: HashMap::new(),
            startup_script: None,
            restore_snapshot: false,
            workspace_bundle: Some(archive),
        };
        match host.acquire(create).await {
            Ok(()) => {
                self.store
                    .set_session_sandbox(&child_id, Some(&child_id))
                    .await?;
                self.store
                    .update_session_status(&child_id, SessionStatus::Active)
                    .await?;
                info!("Session {} forked from {}", child_id, parent.id);
                self.load(tenant_id, &child_id).await
            }
            Err(e) => {
                self.store
                    .update_session_status(&child_id, SessionStatus::Error)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Snapshot + destroy for pause/stop. Failures are logged; the status
    /// transition still happens (the sandbox may already be gone).
    async fn release_sandbox(&self, session: &Session) {
        let Some(sandbox_id) = session.sandbox_id.as_deref() else {
            return;
        };
        match self.router.host_for(session.runner_id.as_deref()).await {
            Ok(host) => {
                if let Err(e) = host.release(sandbox_id).await {
                    warn!("Sandbox release for {} failed: {}", session.id, e);
                }
            }
            Err(e) => debug!("No host to release sandbox of {}: {}", session.id, e),
        }
    }

    // ========================================================================
    // Exec & files
    // ========================================================================

    /// Run one shell command in the session's sandbox.
    pub async fn exec(
        &self,
        tenant_id: &str,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, ServiceError> {
        let lock = self.locks.lock_for(session_id);
        let _guard = lock.try_lock().map_err(|_| ServiceError::Busy)?;

        let session = self.load(tenant_id, session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(ServiceError::InvalidState(format!(
                "session is {}, not active",
                session.status
            )));
        }
        let sandbox_id = session
            .sandbox_id
            .as_deref()
            .ok_or_else(|| ServiceError::InvalidState("session has no sandbox".to_string()))?;

        let host = self
            .router
            .host_for(session.runner_id.as_deref())
            .await
            .map_err(ServiceError::from)?;
        host.exec(sandbox_id, command, timeout)
            .await
            .map_err(ServiceError::from)
    }

    /// List workspace files (live sandbox or snapshot, tagged).
    pub async fn list_files(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<FileListing, ServiceError> {
        let session = self.load(tenant_id, session_id).await?;
        match self.router.host_for(session.runner_id.as_deref()).await {
            Ok(host) => host.list_files(&session.id).await.map_err(ServiceError::from),
            Err(HostError::NoRunner) => {
                let root = self.snapshots.snapshot_workspace(&session.id);
                let entries =
                    tokio::task::spawn_blocking(move || workspace_files::list_files(&root))
                        .await
                        .map_err(|e| ServiceError::Internal(e.to_string()))??;
                Ok(FileListing {
                    source: FileSource::Snapshot,
                    entries,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read one workspace file.
    pub async fn read_file(
        &self,
        tenant_id: &str,
        session_id: &str,
        path: &str,
    ) -> Result<FileContent, ServiceError> {
        let session = self.load(tenant_id, session_id).await?;
        match self.router.host_for(session.runner_id.as_deref()).await {
            Ok(host) => host
                .read_file(&session.id, path)
                .await
                .map_err(ServiceError::from),
            Err(HostError::NoRunner) => {
                let root = self.snapshots.snapshot_workspace(&session.id);
                let content = workspace_files::read_file(&root, path)?;
                Ok(FileContent {
                    source: FileSource::Snapshot,
                    content,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write one file into the live workspace.
    pub async fn write_file(
        &self,
        tenant_id: &str,
        session_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), ServiceError> {
        let session = self.load(tenant_id, session_id).await?;
        let host = self
            .router
            .host_for(session.runner_id.as_deref())
            .await
            .map_err(ServiceError::from)?;
        host.write_file(&session.id, path, content)
            .await
            .map_err(ServiceError::from)
    }

    /// Delete one file from the live workspace.
    pub async fn delete_file(
        &self,
        tenant_id: &str,
        session_id: &str,
        path: &str,
    ) -> Result<(), ServiceError> {
        let session = self.load(tenant_id, session_id).await?;
        let host = self
            .router
            .host_for(session.runner_id.as_deref())
            .await
            .map_err(ServiceError::from)?;
        host.delete_file(&session.id, path)
            .await
            .map_err(ServiceError::from)
    }

    // ========================================================================
    // History
    // ========================================================================

    pub async fn list_messages(
        &self,
        tenant_id: &str,
        session_id: &str,
        after_sequence: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, ServiceError> {
        self.load(tenant_id, session_id).await?;
        Ok(self
            .store
            .list_messages(session_id, after_sequence, limit)
            .await?)
    }

    pub async fn list_events(
        &self,
        tenant_id: &str,
        session_id: &str,
        filter: &EventFilter,
    ) -> Result<Vec<SessionEvent>, ServiceError> {
        self.load(tenant_id, session_id).await?;
        Ok(self.store.list_events(session_id, filter).await?)
    }

    /// Bridge log lines (stored as tagged lifecycle events).
    pub async fn list_logs(
        &self,
        tenant_id: &str,
        session_id: &str,
        after_sequence: Option<i64>,
    ) -> Result<Vec<SessionEvent>, ServiceError> {
        self.load(tenant_id, session_id).await?;
        let filter = EventFilter {
            event_type: Some(EventType::Lifecycle),
            after_sequence,
            limit: None,
        };
        let events = self.store.list_events(session_id, &filter).await?;
        Ok(events
            .into_iter()
            .filter(|e| {
                serde_json::from_str::<Value>(&e.data)
                    .map(|v| v.get("op").and_then(Value::as_str) == Some("log"))
                    .unwrap_or(false)
            })
            .collect())
    }
}
