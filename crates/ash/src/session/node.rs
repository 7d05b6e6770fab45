//! Sandbox host abstraction.
//!
//! The session service drives sandboxes through [`SandboxHost`] without
//! knowing whether they run on this node or on a runner. [`LocalHost`]
//! backs the standalone coordinator and the runner daemon; the remote
//! counterpart lives in `crate::runner`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use ash_protocol::{BridgeCommand, BridgeEvent};

use crate::bridge::BridgeError;
use crate::sandbox::files::{self, FileEntry, FileError};
use crate::sandbox::manager::{CreateOptions, ExecOutcome, ManagerError};
use crate::sandbox::pool::{PoolError, SandboxPool};
use crate::snapshot::SnapshotStore;

/// Host failures, mapped onto API errors at the surface.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("a message is already streaming for this session")]
    Busy,

    #[error("sandbox capacity exceeded")]
    CapacityExceeded,

    #[error("no live runner available")]
    NoRunner,

    #[error("bridge unready: {0}")]
    BridgeUnready(String),

    #[error("sandbox create failed: {0}")]
    CreateFailed(String),

    #[error(transparent)]
    File(#[from] FileError),

    #[error("runner unreachable: {0}")]
    Unreachable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<PoolError> for HostError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::CapacityExceeded => HostError::CapacityExceeded,
            PoolError::NotFound(id) => HostError::NotFound(id),
            PoolError::Manager(e) => e.into(),
            PoolError::Store(e) => HostError::Internal(e.to_string()),
        }
    }
}

impl From<ManagerError> for HostError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Bridge(BridgeError::Unready(t)) => {
                HostError::BridgeUnready(format!("ready not received within {:?}", t))
            }
            ManagerError::Bridge(BridgeError::Busy) => HostError::Busy,
            ManagerError::NotFound(id) => HostError::NotFound(id),
            other => HostError::CreateFailed(other.to_string()),
        }
    }
}

impl From<BridgeError> for HostError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Busy => HostError::Busy,
            BridgeError::Unready(t) => {
                HostError::BridgeUnready(format!("ready not received within {:?}", t))
            }
            other => HostError::Internal(other.to_string()),
        }
    }
}

/// Options for acquiring a sandbox on a host.
#[derive(Debug, Clone)]
pub struct HostCreateOptions {
    pub session_id: String,
    pub tenant_id: String,
    pub agent_name: String,
    /// Agent bundle directory on the coordinator.
    pub agent_dir: PathBuf,
    pub credential_env: HashMap<String, String>,
    pub extra_env: HashMap<String, String>,
    pub startup_script: Option<String>,
    /// Cold path: restore the session snapshot before the bridge starts.
    pub restore_snapshot: bool,
    /// Seed snapshot shipped with the create (fork): imported into the
    /// host's snapshot store, then restored like any cold resume.
    pub workspace_bundle: Option<Vec<u8>>,
}

impl HostCreateOptions {
    pub fn into_manager_options(self) -> CreateOptions {
        CreateOptions {
            session_id: self.session_id,
            tenant_id: self.tenant_id,
            agent_name: self.agent_name,
            agent_dir: self.agent_dir,
            credential_env: self.credential_env,
            extra_env: self.extra_env,
            startup_script: self.startup_script,
            restore_snapshot: self.restore_snapshot,
        }
    }
}

/// One bridge query as seen by a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySpec {
    pub session_id: String,
    /// `None` resumes the upstream SDK session with an empty prompt.
    pub prompt: Option<String>,
    #[serde(default)]
    pub include_partial_messages: bool,
    #[serde(default)]
    pub model: Option<String>,
}

impl QuerySpec {
    pub fn to_command(&self) -> BridgeCommand {
        match &self.prompt {
            Some(prompt) => BridgeCommand::Query {
                prompt: prompt.clone(),
                session_id: self.session_id.clone(),
                include_partial_messages: Some(self.include_partial_messages),
                model: self.model.clone(),
            },
            None => BridgeCommand::Resume {
                session_id: self.session_id.clone(),
            },
        }
    }
}

/// Where file data was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSource {
    Sandbox,
    Snapshot,
}

/// Directory listing tagged with its source.
#[derive(Debug, Clone, Serialize)]
pub struct FileListing {
    pub source: FileSource,
    pub entries: Vec<FileEntry>,
}

/// File content tagged with its source.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub source: FileSource,
    pub content: Vec<u8>,
}

/// Lazy bridge event sequence.
pub type EventStream = BoxStream<'static, BridgeEvent>;

/// A node that can host sandboxes: this process or a runner.
#[async_trait]
pub trait SandboxHost: Send + Sync {
    /// Acquire a sandbox (warm reuse or cold create).
    async fn acquire(&self, opts: HostCreateOptions) -> Result<(), HostError>;

    /// Whether the session's sandbox is alive for warm resume.
    async fn is_warm(&self, sandbox_id: &str) -> bool;

    /// Open a query stream against the sandbox's bridge.
    async fn query(&self, sandbox_id: &str, spec: QuerySpec) -> Result<EventStream, HostError>;

    /// Interrupt the in-flight query.
    async fn interrupt(&self, sandbox_id: &str) -> Result<(), HostError>;

    /// Run one shell command in the sandbox.
    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, HostError>;

    /// Snapshot + destroy + mark cold (pause/stop/evict semantics).
    async fn release(&self, sandbox_id: &str) -> Result<(), HostError>;

    /// Destroy and delete the record (end semantics); the snapshot store
    /// entry is retained for audit.
    async fn destroy(&self, sandbox_id: &str) -> Result<(), HostError>;

    /// Snapshot the live workspace (if any) and return the packed snapshot
    /// archive, or `None` when no snapshot exists. Used by fork.
    async fn snapshot_archive(
        &self,
        sandbox_id: &str,
        agent_name: &str,
    ) -> Result<Option<Vec<u8>>, HostError>;

    /// List workspace files (live sandbox preferred, snapshot fallback).
    async fn list_files(&self, sandbox_id: &str) -> Result<FileListing, HostError>;

    /// Read one workspace file.
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, HostError>;

    /// Write one file into the live workspace.
    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), HostError>;

    /// Delete one file from the live workspace.
    async fn delete_file(&self, sandbox_id: &str, path: &str) -> Result<(), HostError>;
}

// ============================================================================
// Local host
// ============================================================================

/// Sandboxes hosted by this process (standalone coordinator or runner).
pub struct LocalHost {
    pool: Arc<SandboxPool>,
    snapshots: SnapshotStore,
}

impl LocalHost {
    pub fn new(pool: Arc<SandboxPool>, snapshots: SnapshotStore) -> Self {
        Self { pool, snapshots }
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    /// Workspace root if the sandbox is live, else the snapshot root.
    fn file_root(&self, sandbox_id: &str) -> (FileSource, PathBuf) {
        let workspace = self.pool.manager().workspace_dir(sandbox_id);
        if workspace.exists() {
            (FileSource::Sandbox, workspace)
        } else {
            (
                FileSource::Snapshot,
                self.snapshots.snapshot_workspace(sandbox_id),
            )
        }
    }
}

/// Re-marks the sandbox as waiting when a query stream is dropped, whether
/// it completed or the caller disconnected mid-stream.
struct QueryReleaseGuard {
    pool: Arc<SandboxPool>,
    sandbox_id: String,
}

impl Drop for QueryReleaseGuard {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let id = self.sandbox_id.clone();
        tokio::spawn(async move {
            let _ = pool.mark_waiting(&id).await;
        });
    }
}

#[async_trait]
impl SandboxHost for LocalHost {
    async fn acquire(&self, mut opts: HostCreateOptions) -> Result<(), HostError> {
        if let Some(bundle) = opts.workspace_bundle.take() {
            let imported = self
                .snapshots
                .import_archive(&opts.session_id, bundle, &opts.agent_name)
                .await;
            if !imported {
                return Err(HostError::CreateFailed(
                    "seed snapshot import failed".to_string(),
                ));
            }
            opts.restore_snapshot = true;
        }
        self.pool
            .acquire(opts.into_manager_options())
            .await
            .map(|_| ())
            .map_err(HostError::from)
    }

    async fn is_warm(&self, sandbox_id: &str) -> bool {
        self.pool.is_live(sandbox_id).await && self.pool.manager().is_alive(sandbox_id).await
    }

    async fn query(&self, sandbox_id: &str, spec: QuerySpec) -> Result<EventStream, HostError> {
        let client = self
            .pool
            .manager()
            .get_client(sandbox_id)
            .await
            .ok_or_else(|| HostError::NotFound(format!("sandbox {}", sandbox_id)))?;

        let mut stream = client.send_command(&spec.to_command()).await?;
        self.pool.mark_running(sandbox_id).await?;

        let guard = QueryReleaseGuard {
            pool: self.pool.clone(),
            sandbox_id: sandbox_id.to_string(),
        };

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            while let Some(event) = stream.next().await {
                yield event;
            }
        }))
    }

    async fn interrupt(&self, sandbox_id: &str) -> Result<(), HostError> {
        let client = self
            .pool
            .manager()
            .get_client(sandbox_id)
            .await
            .ok_or_else(|| HostError::NotFound(format!("sandbox {}", sandbox_id)))?;
        client.write_command(&BridgeCommand::Interrupt).await?;
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, HostError> {
        self.pool
            .manager()
            .exec(sandbox_id, command, timeout)
            .await
            .map_err(HostError::from)
    }

    async fn release(&self, sandbox_id: &str) -> Result<(), HostError> {
        self.pool.evict(sandbox_id).await.map_err(HostError::from)
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), HostError> {
        self.pool.remove(sandbox_id).await.map_err(HostError::from)
    }

    async fn snapshot_archive(
        &self,
        sandbox_id: &str,
        agent_name: &str,
    ) -> Result<Option<Vec<u8>>, HostError> {
        let workspace = self.pool.manager().workspace_dir(sandbox_id);
        if workspace.exists() {
            self.pool.manager().persist(sandbox_id, agent_name).await;
        }
        Ok(self.snapshots.export_archive(sandbox_id).await)
    }

    async fn list_files(&self, sandbox_id: &str) -> Result<FileListing, HostError> {
        let (source, root) = self.file_root(sandbox_id);
        let entries = tokio::task::spawn_blocking(move || files::list_files(&root))
            .await
            .map_err(|e| HostError::Internal(e.to_string()))??;
        Ok(FileListing { source, entries })
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, HostError> {
        let (source, root) = self.file_root(sandbox_id);
        let content = files::read_file(&root, path)?;
        Ok(FileContent { source, content })
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), HostError> {
        let workspace = self.pool.manager().workspace_dir(sandbox_id);
        if !workspace.exists() {
            return Err(HostError::NotFound(format!(
                "no live sandbox for {}",
                sandbox_id
            )));
        }
        files::write_file(&workspace, path, content)?;
        Ok(())
    }

    async fn delete_file(&self, sandbox_id: &str, path: &str) -> Result<(), HostError> {
        let workspace = self.pool.manager().workspace_dir(sandbox_id);
        if !workspace.exists() {
            return Err(HostError::NotFound(format!(
                "no live sandbox for {}",
                sandbox_id
            )));
        }
        files::delete_file(&workspace, path)?;
        Ok(())
    }
}
