//! Sandbox pool.
//!
//! Owns the fleet's sandbox state on one node: the capacity cap, the
//! per-sandbox state machine, LRU eviction, idle sweep, and cold-record TTL
//! cleanup. Every state transition is written through the store so the pool
//! is recoverable after a process restart.
//!
//! The pool mutex guards the in-memory map and counters only; operations
//! that block on I/O (create, destroy, snapshot) release it and reacquire
//! to commit, so the counters seen under the lock always match the map.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use super::limits::DiskOverLimit;
use super::manager::{CreateOptions, ManagerError, SandboxManager};
use crate::store::models::{SandboxState, SessionStatus};
use crate::store::{SharedStore, StoreError};

/// Pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("sandbox capacity exceeded and nothing evictable")]
    CapacityExceeded,

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pool tunables, derived from server config.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_capacity: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub cold_ttl: Duration,
    pub cold_cleanup_interval: Duration,
}

/// Observability counters exposed on `/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub capacity: usize,
    pub warming: usize,
    pub warm: usize,
    pub waiting: usize,
    pub running: usize,
    pub resume_warm_hits: u64,
    pub resume_cold_hits: u64,
}

/// Result of acquiring a sandbox for a session.
#[derive(Debug, Clone)]
pub struct AcquiredSandbox {
    pub id: String,
    pub workspace_dir: std::path::PathBuf,
    /// Whether an existing warm sandbox was reused.
    pub warm: bool,
}

#[derive(Debug)]
struct Entry {
    state: SandboxState,
    session_id: String,
    agent_name: String,
    last_used: Instant,
    /// Held by a caller (in-flight query); never evicted.
    pinned: bool,
}

/// Per-node sandbox inventory.
pub struct SandboxPool {
    config: PoolConfig,
    store: SharedStore,
    manager: Arc<SandboxManager>,
    entries: Mutex<HashMap<String, Entry>>,
    resume_warm_hits: AtomicU64,
    resume_cold_hits: AtomicU64,
}

impl SandboxPool {
    pub fn new(config: PoolConfig, store: SharedStore, manager: Arc<SandboxManager>) -> Self {
        Self {
            config,
            store,
            manager,
            entries: Mutex::new(HashMap::new()),
            resume_warm_hits: AtomicU64::new(0),
            resume_cold_hits: AtomicU64::new(0),
        }
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// Acquire a sandbox for a session: reuse a warm one (warm path) or
    /// create a fresh one (cold path), evicting LRU under capacity pressure.
    pub async fn acquire(&self, opts: CreateOptions) -> Result<AcquiredSandbox, PoolError> {
        let id = opts.session_id.clone();

        // Warm path: the sandbox is still warm or waiting.
        let reusable = {
            let entries = self.entries.lock().await;
            entries
                .get(&id)
                .map(|e| matches!(e.state, SandboxState::Warm | SandboxState::Waiting))
                .unwrap_or(false)
        };
        if reusable {
            if self.manager.is_alive(&id).await {
                self.touch(&id).await;
                if opts.restore_snapshot {
                    self.resume_warm_hits.fetch_add(1, Ordering::Relaxed);
                }
                debug!("Warm sandbox reuse for session {}", id);
                return Ok(AcquiredSandbox {
                    workspace_dir: self.manager.workspace_dir(&id),
                    id,
                    warm: true,
                });
            }
            // Process died underneath us; record it and fall through cold.
            warn!("Sandbox {} found dead on acquire, marking cold", id);
            self.transition_cold(&id).await?;
        }

        // Cold path: reserve capacity, evicting if needed.
        loop {
            let evict_candidate = {
                let mut entries = self.entries.lock().await;
                let live = entries.values().filter(|e| e.state.is_live()).count();
                if live < self.config.max_capacity {
                    // Reserve a slot under the lock so concurrent acquires
                    // cannot overshoot the cap.
                    entries.insert(
                        id.clone(),
                        Entry {
                            state: SandboxState::Warming,
                            session_id: opts.session_id.clone(),
                            agent_name: opts.agent_name.clone(),
                            last_used: Instant::now(),
                            pinned: false,
                        },
                    );
                    None
                } else {
                    match lru_evictable(&entries) {
                        Some(victim) => Some(victim),
                        None => return Err(PoolError::CapacityExceeded),
                    }
                }
            };

            match evict_candidate {
                None => break,
                Some(victim) => {
                    info!("Evicting LRU sandbox {} to make room for {}", victim, id);
                    self.evict(&victim).await?;
                }
            }
        }

        let restore = opts.restore_snapshot;
        match self.manager.create(opts).await {
            Ok(sandbox) => {
                self.commit_state(&id, SandboxState::Warm, false).await;
                if restore {
                    self.resume_cold_hits.fetch_add(1, Ordering::Relaxed);
                }
                Ok(AcquiredSandbox {
                    id: sandbox.id,
                    workspace_dir: sandbox.workspace_dir,
                    warm: false,
                })
            }
            Err(e) => {
                self.entries.lock().await.remove(&id);
                Err(e.into())
            }
        }
    }

    /// Query started: `waiting/warm -> running`, pinned against eviction.
    pub async fn mark_running(&self, id: &str) -> Result<(), PoolError> {
        self.commit_state(id, SandboxState::Running, true).await;
        self.store
            .set_sandbox_state(id, SandboxState::Running)
            .await?;
        Ok(())
    }

    /// Query finished: `running -> waiting`, evictable again.
    pub async fn mark_waiting(&self, id: &str) -> Result<(), PoolError> {
        self.commit_state(id, SandboxState::Waiting, false).await;
        self.store
            .set_sandbox_state(id, SandboxState::Waiting)
            .await?;
        Ok(())
    }

    /// Evict one sandbox: snapshot, destroy the process, record cold, and
    /// pause the owning session. The workspace stays on disk until the
    /// cold-record cleanup prunes it.
    pub async fn evict(&self, id: &str) -> Result<(), PoolError> {
        let (session_id, agent_name) = {
            let mut entries = self.entries.lock().await;
            match entries.remove(id) {
                Some(entry) => (entry.session_id, entry.agent_name),
                None => return Ok(()),
            }
        };

        self.manager.persist(id, &agent_name).await;
        self.manager.destroy(id, true).await?;
        self.store.set_sandbox_state(id, SandboxState::Cold).await?;
        self.store
            .update_session_status(&session_id, SessionStatus::Paused)
            .await?;
        info!("Sandbox {} evicted (session {} paused)", id, session_id);
        Ok(())
    }

    /// Destroy a sandbox without keeping the record (session end). The
    /// snapshot store entry is left for audit.
    pub async fn remove(&self, id: &str) -> Result<(), PoolError> {
        self.entries.lock().await.remove(id);
        self.manager.destroy(id, false).await?;
        self.store.delete_sandbox(id).await?;
        Ok(())
    }

    /// Mark a sandbox cold without snapshotting (the process is already
    /// gone).
    pub async fn transition_cold(&self, id: &str) -> Result<(), PoolError> {
        self.entries.lock().await.remove(id);
        let _ = self.manager.destroy(id, true).await;
        self.store.set_sandbox_state(id, SandboxState::Cold).await?;
        Ok(())
    }

    async fn commit_state(&self, id: &str, state: SandboxState, pinned: bool) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.state = state;
            entry.pinned = pinned;
            entry.last_used = Instant::now();
        }
    }

    async fn touch(&self, id: &str) {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(id) {
                entry.last_used = Instant::now();
            }
        }
        let _ = self.store.touch_sandbox(id).await;
    }

    /// Whether a live entry exists for this sandbox.
    pub async fn is_live(&self, id: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(id)
            .map(|e| e.state.is_live())
            .unwrap_or(false)
    }

    /// Current counters.
    pub async fn metrics(&self) -> PoolMetrics {
        let entries = self.entries.lock().await;
        let count = |state: SandboxState| entries.values().filter(|e| e.state == state).count();
        PoolMetrics {
            capacity: self.config.max_capacity,
            warming: count(SandboxState::Warming),
            warm: count(SandboxState::Warm),
            waiting: count(SandboxState::Waiting),
            running: count(SandboxState::Running),
            resume_warm_hits: self.resume_warm_hits.load(Ordering::Relaxed),
            resume_cold_hits: self.resume_cold_hits.load(Ordering::Relaxed),
        }
    }

    /// Live sandbox count (warming + warm + waiting + running).
    pub async fn live_count(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.state.is_live()).count()
    }

    /// Startup recovery: re-examine every stored sandbox. Processes never
    /// survive a coordinator restart as managed children, so every live-state
    /// record is snapshotted from its on-disk workspace, its recorded pid
    /// signalled, and the record marked cold; the owning session becomes
    /// paused and cold-resumes on next use.
    pub async fn recover(&self) -> Result<(), PoolError> {
        let records = self.store.list_sandboxes().await?;
        for record in records {
            if !record.state.is_live() {
                continue;
            }
            let workspace = std::path::Path::new(&record.workspace_dir);
            if workspace.exists() {
                self.manager.persist(&record.id, &record.agent_name).await;
            }
            if let Some(pid) = record.pid {
                if pid_alive(pid) {
                    // SAFETY: best-effort signal to a recorded pid.
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
            }
            self.store
                .set_sandbox_state(&record.id, SandboxState::Cold)
                .await?;
            if let Some(ref session_id) = record.session_id {
                self.store
                    .update_session_status(session_id, SessionStatus::Paused)
                    .await?;
            }
            info!("Recovered sandbox {} as cold on startup", record.id);
        }
        Ok(())
    }

    /// Start the idle sweep, cold cleanup, and disk-notice loops.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        mut disk_notices: mpsc::Receiver<DiskOverLimit>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        // Idle sweep.
        let pool = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.sweep_idle().await;
            }
        }));

        // Cold-record TTL cleanup.
        let pool = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.cold_cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.cleanup_cold().await;
            }
        }));

        // Disk ceiling breaches force eviction.
        let pool = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(notice) = disk_notices.recv().await {
                warn!(
                    "Sandbox {} over disk ceiling ({} > {} bytes), evicting",
                    notice.sandbox_id, notice.used_bytes, notice.limit_bytes
                );
                if let Err(e) = pool.evict(&notice.sandbox_id).await {
                    warn!("Disk eviction of {} failed: {}", notice.sandbox_id, e);
                }
            }
        }));

        tasks
    }

    /// Evict every unpinned warm/waiting sandbox idle past the timeout.
    pub async fn sweep_idle(&self) {
        let idle: Vec<String> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|(_, e)| {
                    matches!(e.state, SandboxState::Warm | SandboxState::Waiting)
                        && !e.pinned
                        && e.last_used.elapsed() > self.config.idle_timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in idle {
            debug!("Idle sweep evicting sandbox {}", id);
            if let Err(e) = self.evict(&id).await {
                warn!("Idle eviction of {} failed: {}", id, e);
            }
        }
    }

    /// Delete cold records older than the TTL, pruning their workspaces.
    pub async fn cleanup_cold(&self) {
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::from_std(self.config.cold_ttl).unwrap_or_default())
        .to_rfc3339();

        let stale = match self.store.list_stale_cold_sandboxes(&cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!("Cold cleanup listing failed: {}", e);
                return;
            }
        };

        for record in stale {
            debug!("Cold cleanup deleting sandbox record {}", record.id);
            self.manager.prune_workspace(&record.id).await;
            if let Err(e) = self.store.delete_sandbox(&record.id).await {
                warn!("Cold cleanup of {} failed: {}", record.id, e);
            }
        }
    }
}

/// Least-recently-used evictable sandbox: warm or waiting, not pinned.
fn lru_evictable(entries: &HashMap<String, Entry>) -> Option<String> {
    entries
        .iter()
        .filter(|(_, e)| {
            matches!(e.state, SandboxState::Warm | SandboxState::Waiting) && !e.pinned
        })
        .min_by_key(|(_, e)| e.last_used)
        .map(|(id, _)| id.clone())
}

fn pid_alive(pid: i64) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
