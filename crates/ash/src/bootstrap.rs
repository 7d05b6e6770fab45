//! Service wiring.
//!
//! Builds the coordinator and runner stacks from configuration; shared by
//! `main` and the integration tests.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::agent::AgentService;
use crate::api::{AppState, RunnerApiState};
use crate::auth::AuthState;
use crate::config::{Config, RunnerConfig, ServerMode};
use crate::runner::registry::RunnerRegistry;
use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::manager::{ManagerConfig, SandboxManager};
use crate::sandbox::pool::{PoolConfig, SandboxPool};
use crate::session::{HostRouter, LocalHost, SessionService};
use crate::snapshot::{CloudMirror, SnapshotStore};
use crate::store::{self, SharedStore};

/// Everything needed to host sandboxes on this node.
pub struct LocalStack {
    pub store: SharedStore,
    pub snapshots: SnapshotStore,
    pub manager: Arc<SandboxManager>,
    pub pool: Arc<SandboxPool>,
    pub host: Arc<LocalHost>,
    pub background: Vec<tokio::task::JoinHandle<()>>,
}

/// A wired coordinator ready to serve.
pub struct Coordinator {
    pub state: AppState,
    pub local: Option<LocalStack>,
}

/// Locate the bridge binary: explicit env override, then a sibling of the
/// server binary, then `$PATH`.
pub fn resolve_bridge_binary() -> String {
    if let Ok(explicit) = std::env::var("ASH_BRIDGE_BINARY") {
        return explicit;
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("ash-bridge");
            if sibling.is_file() {
                return sibling.to_string_lossy().to_string();
            }
        }
    }
    "ash-bridge".to_string()
}

fn build_cloud_mirror(config: &Config) -> Result<Option<CloudMirror>> {
    match &config.snapshot_url {
        Some(url) => {
            let mirror = CloudMirror::from_url(url, config.snapshot_auth.clone())
                .context("invalid ASH_SNAPSHOT_URL")?;
            info!("Cloud snapshot mirror enabled: {}", url);
            Ok(Some(mirror))
        }
        None => Ok(None),
    }
}

/// Build the local sandbox-hosting stack (store, snapshots, manager, pool).
pub async fn build_local_stack(config: &Config, store: SharedStore) -> Result<LocalStack> {
    tokio::fs::create_dir_all(config.sandboxes_dir()).await?;
    tokio::fs::create_dir_all(config.sessions_dir()).await?;

    let snapshots = SnapshotStore::new(config.sessions_dir(), build_cloud_mirror(config)?);

    let (disk_tx, disk_rx) = mpsc::channel(32);
    let manager = Arc::new(SandboxManager::new(
        ManagerConfig {
            sandboxes_dir: config.sandboxes_dir(),
            bridge_binary: resolve_bridge_binary(),
            limits: ResourceLimits::default(),
            strict_isolation: config.strict_isolation,
            install_timeout: config.install_timeout(),
            ready_timeout: config.ready_timeout(),
            shutdown_grace: config.shutdown_grace(),
        },
        store.clone(),
        snapshots.clone(),
        disk_tx,
    ));

    let pool = Arc::new(SandboxPool::new(
        PoolConfig {
            max_capacity: config.max_sandboxes,
            idle_timeout: config.idle_timeout(),
            sweep_interval: std::time::Duration::from_millis(config.idle_sweep_interval_ms),
            cold_ttl: std::time::Duration::from_millis(config.cold_cleanup_ttl_ms),
            cold_cleanup_interval: std::time::Duration::from_millis(
                config.cold_cleanup_interval_ms,
            ),
        },
        store.clone(),
        manager.clone(),
    ));

    // Re-examine every stored sandbox before accepting work.
    pool.recover().await.context("pool recovery failed")?;
    cleanup_orphan_workspaces(config, &store).await;

    let background = pool.spawn_background_tasks(disk_rx);
    let host = Arc::new(LocalHost::new(pool.clone(), snapshots.clone()));

    Ok(LocalStack {
        store,
        snapshots,
        manager,
        pool,
        host,
        background,
    })
}

/// Remove workspace directories that no sandbox record points at.
async fn cleanup_orphan_workspaces(config: &Config, store: &SharedStore) {
    let Ok(mut entries) = tokio::fs::read_dir(config.sandboxes_dir()).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        match store.get_sandbox(&name).await {
            Ok(None) => {
                warn!("Pruning orphan workspace {}", name);
                let _ = tokio::fs::remove_dir_all(entry.path()).await;
            }
            Ok(Some(_)) => {}
            Err(e) => warn!("Orphan scan failed for {}: {}", name, e),
        }
    }
}

/// Build the full coordinator: store, services, routes.
pub async fn build_coordinator(config: &Config) -> Result<Coordinator> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(config.agents_dir()).await?;

    let store = store::open(&config.effective_database_url())
        .await
        .context("opening state store")?;

    let local = match config.mode {
        ServerMode::Standalone => Some(build_local_stack(config, store.clone()).await?),
        ServerMode::Coordinator => {
            info!("Coordinator mode: sandboxes dispatch to runners only");
            None
        }
    };

    let registry = Arc::new(RunnerRegistry::new(store.clone()));
    let router = Arc::new(HostRouter::new(
        local.as_ref().map(|l| l.host.clone()),
        registry.clone(),
        config.internal_secret.clone(),
    ));

    let agents = Arc::new(AgentService::new(store.clone(), config.agents_dir()));
    let snapshots = match &local {
        Some(stack) => stack.snapshots.clone(),
        None => SnapshotStore::new(config.sessions_dir(), build_cloud_mirror(config)?),
    };
    let sessions = Arc::new(SessionService::new(
        store.clone(),
        snapshots,
        agents.clone(),
        router,
        config.debug_timing,
    ));

    let auth_enabled = config.api_key.is_some();
    if let Some(ref key) = config.api_key {
        AuthState::seed_primary_key(&store, key)
            .await
            .context("seeding primary API key")?;
        info!("API-key auth enabled");
    }
    let auth = AuthState::new(store.clone(), auth_enabled, config.internal_secret.clone());

    let state = AppState::new(
        sessions,
        agents,
        registry,
        local.as_ref().map(|l| l.pool.clone()),
        auth,
    );

    Ok(Coordinator { state, local })
}

/// Build the runner-mode stack and its internal API state.
pub async fn build_runner(config: &Config, runner: &RunnerConfig) -> Result<(RunnerApiState, LocalStack, String)> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(config.agents_dir()).await?;

    let store = store::open(&config.effective_database_url())
        .await
        .context("opening runner state store")?;

    let stack = build_local_stack(config, store.clone()).await?;
    let auth = AuthState::new(store.clone(), false, config.internal_secret.clone());

    let runner_id = runner
        .id
        .clone()
        .unwrap_or_else(|| format!("runner-{}", uuid::Uuid::new_v4()));

    let state = RunnerApiState {
        host: stack.host.clone(),
        pool: stack.pool.clone(),
        store,
        agents_dir: config.agents_dir(),
        auth,
    };

    Ok((state, stack, runner_id))
}
