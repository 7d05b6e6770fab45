//! Sandbox manager.
//!
//! Creates and destroys sandboxes on one node: copy the agent bundle into a
//! fresh workspace, run `install.sh` under a bounded timeout, spawn the
//! bridge under the resource-limits layer, connect the bridge client, and
//! keep the per-sandbox bookkeeping (client, child process, disk monitor).
//!
//! Any failure during create rolls back everything done so far: child
//! killed, workspace removed, record deleted.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};

use ash_protocol::{BridgeCommand, BridgeEvent};

use super::limits::{
    self, DiskOverLimit, ResourceLimits, SpawnCapabilities, spawn_limited,
};
use crate::bridge::{BridgeClient, BridgeError};
use crate::snapshot::SnapshotStore;
use crate::store::models::{SandboxRecord, SandboxState, now_rfc3339};
use crate::store::{SharedStore, StoreError};

/// Default timeout for `exec` commands.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between disk monitor measurements.
const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Sandbox manager failures.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("agent directory missing: {0}")]
    AgentDirMissing(PathBuf),

    #[error("install.sh failed with exit code {code}: {stderr}")]
    InstallFailed { code: i32, stderr: String },

    #[error("install.sh timed out after {0:?}")]
    InstallTimeout(Duration),

    #[error("startup script failed with exit code {code}: {stderr}")]
    StartupScriptFailed { code: i32, stderr: String },

    #[error("sandbox spawn failed: {0}")]
    Spawn(#[from] limits::LimitsError),

    #[error("bridge not ready: {0}")]
    Bridge(#[from] BridgeError),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("exec timed out after {0:?}")]
    ExecTimeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options for creating one sandbox.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub session_id: String,
    pub tenant_id: String,
    pub agent_name: String,
    pub agent_dir: PathBuf,
    /// Decrypted credential variables, merged under the caller's env.
    pub credential_env: HashMap<String, String>,
    /// Caller-supplied variables; win on collisions.
    pub extra_env: HashMap<String, String>,
    /// Optional script run after install.sh, before the bridge.
    pub startup_script: Option<String>,
    /// Restore the session snapshot into the workspace before spawning.
    pub restore_snapshot: bool,
}

/// A live sandbox as seen by callers of the manager.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedSandbox {
    pub id: String,
    pub socket_path: PathBuf,
    pub workspace_dir: PathBuf,
    pub pid: Option<u32>,
    pub capabilities: SpawnCapabilities,
}

/// Result of one `exec` command.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Tunables for the manager, derived from server config.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub sandboxes_dir: PathBuf,
    pub bridge_binary: String,
    pub limits: ResourceLimits,
    pub strict_isolation: bool,
    pub install_timeout: Duration,
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
}

struct SandboxHandles {
    client: Arc<BridgeClient>,
    child: Child,
    monitor: tokio::task::JoinHandle<()>,
    capabilities: SpawnCapabilities,
}

/// Creates and destroys sandboxes on this node.
pub struct SandboxManager {
    config: ManagerConfig,
    store: SharedStore,
    snapshots: SnapshotStore,
    handles: Mutex<HashMap<String, SandboxHandles>>,
    disk_notices: mpsc::Sender<DiskOverLimit>,
}

impl SandboxManager {
    /// Build a manager; `disk_notices` receives over-limit workspaces so the
    /// pool can evict them.
    pub fn new(
        config: ManagerConfig,
        store: SharedStore,
        snapshots: SnapshotStore,
        disk_notices: mpsc::Sender<DiskOverLimit>,
    ) -> Self {
        Self {
            config,
            store,
            snapshots,
            handles: Mutex::new(HashMap::new()),
            disk_notices,
        }
    }

    fn sandbox_home(&self, id: &str) -> PathBuf {
        self.config.sandboxes_dir.join(id)
    }

    /// Workspace directory for a sandbox id.
    pub fn workspace_dir(&self, id: &str) -> PathBuf {
        self.sandbox_home(id).join("workspace")
    }

    fn socket_path(&self, id: &str) -> PathBuf {
        self.workspace_dir(id).join("bridge.sock")
    }

    /// Create a sandbox: workspace, bundle copy, install, optional restore,
    /// bridge spawn, readiness.
    pub async fn create(&self, opts: CreateOptions) -> Result<ManagedSandbox, ManagerError> {
        let id = opts.session_id.clone();
        let workspace = self.workspace_dir(&id);

        if !opts.agent_dir.is_dir() {
            return Err(ManagerError::AgentDirMissing(opts.agent_dir.clone()));
        }

        let started = tokio::time::Instant::now();

        // 1. Allocate the workspace and record the warming sandbox.
        tokio::fs::create_dir_all(&workspace).await?;
        let record = SandboxRecord {
            id: id.clone(),
            tenant_id: opts.tenant_id.clone(),
            session_id: Some(opts.session_id.clone()),
            agent_name: opts.agent_name.clone(),
            state: SandboxState::Warming,
            workspace_dir: workspace.to_string_lossy().to_string(),
            pid: None,
            created_at: now_rfc3339(),
            last_used_at: now_rfc3339(),
        };
        self.store.insert_sandbox(&record).await?;

        match self.create_inner(&opts, &workspace).await {
            Ok(sandbox) => {
                self.store
                    .set_sandbox_state(&id, SandboxState::Warm)
                    .await?;
                self.store
                    .set_sandbox_pid(&id, sandbox.pid.map(|p| p as i64))
                    .await?;
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Sandbox {} warm in {} ms",
                        id,
                        started.elapsed().as_millis()
                    );
                }
                info!("Sandbox {} created for agent {}", id, opts.agent_name);
                Ok(sandbox)
            }
            Err(e) => {
                warn!("Sandbox {} create failed, rolling back: {}", id, e);
                self.rollback(&id).await;
                Err(e)
            }
        }
    }

    async fn create_inner(
        &self,
        opts: &CreateOptions,
        workspace: &Path,
    ) -> Result<ManagedSandbox, ManagerError> {
        let id = &opts.session_id;

        // 2. Copy the agent bundle into the workspace.
        let agent_dir = opts.agent_dir.clone();
        let dest = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || copy_dir_all(&agent_dir, &dest))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

        // Build the sandbox environment once: allowlist, then credentials,
        // then caller extras (caller wins on collisions).
        let mut env = limits::allowlisted_env();
        env.extend(opts.credential_env.clone());
        env.extend(opts.extra_env.clone());

        // 3. install.sh, fatal on non-zero exit.
        if workspace.join("install.sh").is_file() {
            self.run_script(id, "sh install.sh", workspace, &env, true)
                .await?;
        }

        // 4. Caller-supplied startup script.
        if let Some(ref script) = opts.startup_script {
            self.run_script(id, script, workspace, &env, false).await?;
        }

        // Cold-path restore happens before the bridge ever starts.
        if opts.restore_snapshot {
            self.snapshots.restore(id, workspace).await;
        }

        // 5-6. Socket path + bridge spawn under the limits layer.
        let socket_path = self.socket_path(id);
        if socket_path.exists() {
            let _ = tokio::fs::remove_file(&socket_path).await;
        }
        env.insert(
            "ASH_BRIDGE_SOCKET".to_string(),
            socket_path.to_string_lossy().to_string(),
        );
        env.insert(
            "ASH_AGENT_DIR".to_string(),
            workspace.to_string_lossy().to_string(),
        );
        env.insert(
            "ASH_WORKSPACE_DIR".to_string(),
            workspace.to_string_lossy().to_string(),
        );

        let extra_binds = bridge_binary_binds(&self.config.bridge_binary);
        let (mut child, capabilities) = spawn_limited(
            &self.config.bridge_binary,
            &[],
            workspace,
            &env,
            &extra_binds,
            &self.config.limits,
            self.config.strict_isolation,
        )?;
        let pid = child.id();

        // Keep the bridge's pipes drained for its whole lifetime.
        spawn_pipe_logger(id.clone(), "stdout", child.stdout.take());
        spawn_pipe_logger(id.clone(), "stderr", child.stderr.take());

        // 7. Connect and await `ready`.
        let client = BridgeClient::connect(&socket_path, self.config.ready_timeout).await?;

        let monitor = limits::spawn_disk_monitor(
            id.clone(),
            workspace.to_path_buf(),
            self.config.limits.disk_mb,
            DISK_CHECK_INTERVAL,
            self.disk_notices.clone(),
        );

        let mut handles = self.handles.lock().await;
        handles.insert(
            id.clone(),
            SandboxHandles {
                client: Arc::new(client),
                child,
                monitor,
                capabilities,
            },
        );

        Ok(ManagedSandbox {
            id: id.clone(),
            socket_path,
            workspace_dir: workspace.to_path_buf(),
            pid,
            capabilities,
        })
    }

    async fn run_script(
        &self,
        id: &str,
        script: &str,
        workspace: &Path,
        env: &HashMap<String, String>,
        is_install: bool,
    ) -> Result<(), ManagerError> {
        debug!("Sandbox {} running script: {}", id, script);
        let (mut child, _caps) = spawn_limited(
            "sh",
            &["-c".to_string(), script.to_string()],
            workspace,
            env,
            &[],
            &self.config.limits,
            self.config.strict_isolation,
        )?;

        // Drain both pipes while waiting so a chatty script never blocks on
        // a full pipe buffer.
        let stdout_task = child.stdout.take().map(drain_to_string);
        let stderr_task = child.stderr.take().map(drain_to_string);

        let status = match tokio::time::timeout(self.config.install_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(ManagerError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                return Err(ManagerError::InstallTimeout(self.config.install_timeout));
            }
        };

        if status.success() {
            return Ok(());
        }

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        drop(stdout_task);
        let code = status.code().unwrap_or(-1);
        if is_install {
            Err(ManagerError::InstallFailed { code, stderr })
        } else {
            Err(ManagerError::StartupScriptFailed { code, stderr })
        }
    }

    async fn rollback(&self, id: &str) {
        if let Some(mut handles) = self.handles.lock().await.remove(id) {
            handles.monitor.abort();
            let _ = handles.child.kill().await;
        }
        let home = self.sandbox_home(id);
        if home.exists() {
            let _ = tokio::fs::remove_dir_all(&home).await;
        }
        let _ = self.store.delete_sandbox(id).await;
    }

    /// Tear down the sandbox process. Sends `shutdown` when the bridge is
    /// connected, escalates SIGTERM then SIGKILL after the grace period.
    /// The store record is left to the caller (pool) to transition.
    pub async fn destroy(&self, id: &str, keep_workspace: bool) -> Result<(), ManagerError> {
        let handles = self.handles.lock().await.remove(id);

        if let Some(mut handles) = handles {
            handles.monitor.abort();

            if handles.client.is_alive() {
                let _ = handles.client.write_command(&BridgeCommand::Shutdown).await;
            }

            let grace = self.config.shutdown_grace;
            match tokio::time::timeout(grace, handles.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    // SIGTERM, then SIGKILL after another grace period.
                    if let Some(pid) = handles.child.id() {
                        // SAFETY: signalling a child we own.
                        unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                    }
                    if tokio::time::timeout(grace, handles.child.wait())
                        .await
                        .is_err()
                    {
                        let _ = handles.child.kill().await;
                    }
                }
            }
        } else if let Some(record) = self.store.get_sandbox(id).await? {
            // Process from a previous incarnation; signal by recorded pid.
            if let Some(pid) = record.pid {
                // SAFETY: best-effort signal to a recorded pid.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        let _ = self.store.set_sandbox_pid(id, None).await;

        if !keep_workspace {
            let home = self.sandbox_home(id);
            if home.exists() {
                let _ = tokio::fs::remove_dir_all(&home).await;
            }
        }

        info!("Sandbox {} destroyed (keep_workspace={})", id, keep_workspace);
        Ok(())
    }

    /// Bridge client reused for all commands to this sandbox.
    pub async fn get_client(&self, id: &str) -> Option<Arc<BridgeClient>> {
        self.handles.lock().await.get(id).map(|h| h.client.clone())
    }

    /// Capabilities recorded at spawn time.
    pub async fn capabilities(&self, id: &str) -> Option<SpawnCapabilities> {
        self.handles.lock().await.get(id).map(|h| h.capabilities)
    }

    /// Whether the sandbox process is still alive.
    pub async fn is_alive(&self, id: &str) -> bool {
        let mut handles = self.handles.lock().await;
        match handles.get_mut(id) {
            Some(h) => matches!(h.child.try_wait(), Ok(None)) && h.client.is_alive(),
            None => false,
        }
    }

    /// Run one shell command in the sandbox via the bridge.
    pub async fn exec(
        &self,
        id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, ManagerError> {
        let client = self
            .get_client(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        let timeout = timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);
        let mut stream = client
            .send_command(&BridgeCommand::Exec {
                command: command.to_string(),
                timeout_ms: Some(timeout.as_millis() as u64),
            })
            .await?;

        // The bridge enforces the timeout itself; the outer budget guards
        // against a lost connection.
        let outer = timeout + Duration::from_secs(5);
        let deadline = tokio::time::Instant::now() + outer;
        let mut outcome = None;
        loop {
            let event = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| ManagerError::ExecTimeout(outer))?;
            match event {
                Some(BridgeEvent::ExecResult {
                    exit_code,
                    stdout,
                    stderr,
                }) => {
                    outcome = Some(ExecOutcome {
                        exit_code,
                        stdout,
                        stderr,
                    });
                }
                Some(BridgeEvent::Error { error }) => {
                    return Err(ManagerError::Bridge(BridgeError::Io(
                        std::io::Error::other(error),
                    )));
                }
                Some(_) => continue,
                None => break,
            }
        }

        outcome.ok_or_else(|| ManagerError::NotFound(format!("exec result for {}", id)))
    }

    /// Snapshot the sandbox workspace. Best-effort.
    pub async fn persist(&self, id: &str, agent_name: &str) -> bool {
        let workspace = self.workspace_dir(id);
        if !workspace.exists() {
            return false;
        }
        self.snapshots.persist(id, &workspace, agent_name).await
    }

    /// Delete a sandbox's workspace directory (cold-record cleanup).
    pub async fn prune_workspace(&self, id: &str) {
        let home = self.sandbox_home(id);
        if home.exists() {
            let _ = tokio::fs::remove_dir_all(&home).await;
        }
    }

    /// Send `shutdown` to every live bridge and wait out the grace period.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        for id in &ids {
            if let Some(client) = self.get_client(id).await {
                let _ = client.write_command(&BridgeCommand::Shutdown).await;
            }
        }
        tokio::time::sleep(self.config.shutdown_grace).await;
        for id in &ids {
            if let Some(mut handles) = self.handles.lock().await.remove(id) {
                handles.monitor.abort();
                let _ = handles.child.kill().await;
            }
        }
    }
}

/// Read one child pipe to completion, buffering the text.
fn drain_to_string<R>(reader: R) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        let mut reader = reader;
        let _ = reader.read_to_string(&mut buf).await;
        buf
    })
}

/// Forward a child pipe to the server log, line by line.
fn spawn_pipe_logger<R>(id: String, label: &'static str, reader: Option<R>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return;
    };
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                debug!("sandbox {} {}: {}", id, label, line);
            }
        }
    });
}

/// Host paths that must stay visible inside the namespace so the bridge
/// binary can exec.
fn bridge_binary_binds(bridge_binary: &str) -> Vec<PathBuf> {
    let path = Path::new(bridge_binary);
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => vec![parent.to_path_buf()],
        _ => Vec::new(),
    }
}

/// Plain recursive copy (agent bundles are curated, nothing is filtered).
fn copy_dir_all(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_dir_all() {
        let src = tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("CLAUDE.md"), "You answer questions.").unwrap();
        std::fs::write(src.path().join("a/b/c.txt"), "deep").unwrap();

        let dest = tempdir().unwrap();
        copy_dir_all(src.path(), dest.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("CLAUDE.md")).unwrap(),
            "You answer questions."
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("a/b/c.txt")).unwrap(),
            "deep"
        );
    }

    #[test]
    fn test_bridge_binary_binds() {
        assert_eq!(
            bridge_binary_binds("/opt/ash/bin/ash-bridge"),
            vec![PathBuf::from("/opt/ash/bin")]
        );
        // Bare binary names resolve via PATH inside the namespace.
        assert!(bridge_binary_binds("ash-bridge").is_empty());
    }
}
