//! Resource-limited process spawning.
//!
//! Spawns the bridge (and install scripts) under a filesystem namespace and
//! resource caps. Filesystem isolation uses bubblewrap when available: host
//! root read-only, workspace read-write, private `/tmp`. Memory and process
//! ceilings are rlimits applied in the child before exec. CPU share needs
//! cgroup delegation and is reported unenforced where that is absent.
//!
//! The environment is never broadcast into the sandbox: only the allowlist
//! plus explicitly provided variables pass through.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Variables allowed through from the host environment.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "TERM",
    "USER",
    "SHELL",
    // Upstream SDK configuration.
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_CUSTOM_HEADERS",
    // Ash bridge switches.
    "ASH_SDK_BINARY",
    "ASH_MOCK_SDK",
    "ASH_MOCK_SDK_DELAY_MS",
    "ASH_DEBUG_TIMING",
];

/// Resource ceilings for one sandbox.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceLimits {
    /// RSS ceiling in megabytes.
    pub mem_mb: u64,
    /// CPU share as percent of one core.
    pub cpu_percent: u64,
    /// Workspace disk ceiling in megabytes.
    pub disk_mb: u64,
    /// Process count ceiling.
    pub max_processes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            mem_mb: 2048,
            cpu_percent: 100,
            disk_mb: 1024,
            max_processes: 64,
        }
    }
}

/// Which caps the spawn layer actually enforced.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnCapabilities {
    pub filesystem_isolated: bool,
    pub cpu_capped: bool,
    pub mem_capped: bool,
    pub process_capped: bool,
}

impl SpawnCapabilities {
    /// Minimum bar for strict mode: filesystem view and memory ceiling.
    pub fn meets_strict_minimum(&self) -> bool {
        self.filesystem_isolated && self.mem_capped
    }
}

/// Spawn failures.
#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("failed to spawn sandboxed process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("strict isolation requested but unavailable (enforced: {0:?})")]
    StrictUnmet(SpawnCapabilities),
}

/// How a sandboxed child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Clean exit with the given code.
    Normal(i32),
    /// Killed by the kernel under the memory cap.
    OomKilled,
    /// Killed by some other signal.
    Signaled(i32),
}

/// Classify a child's exit status, distinguishing OOM from normal exit.
pub fn classify_exit(status: std::process::ExitStatus, caps: &SpawnCapabilities) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signal) = status.signal() {
        if signal == libc::SIGKILL && caps.mem_capped {
            return ExitKind::OomKilled;
        }
        return ExitKind::Signaled(signal);
    }
    ExitKind::Normal(status.code().unwrap_or(-1))
}

/// Collect the allowlisted subset of the ambient environment.
pub fn allowlisted_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| ENV_ALLOWLIST.contains(&key.as_str()))
        .collect()
}

/// Check whether bubblewrap is available on this host.
pub fn is_bwrap_available() -> bool {
    std::process::Command::new("bwrap")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Spawn `binary args...` in `workspace` under the configured caps.
///
/// `env` is the complete child environment (the ambient environment is
/// cleared first). `extra_ro_binds` are additional host paths made visible
/// read-only inside the namespace (e.g. the directory holding the bridge
/// binary). Returns the child plus the capabilities actually enforced;
/// strict mode fails instead of degrading.
pub fn spawn_limited(
    binary: &str,
    args: &[String],
    workspace: &Path,
    env: &HashMap<String, String>,
    extra_ro_binds: &[PathBuf],
    limits: &ResourceLimits,
    strict: bool,
) -> Result<(Child, SpawnCapabilities), LimitsError> {
    let mut caps = SpawnCapabilities::default();
    let use_bwrap = is_bwrap_available();

    let mut cmd = if use_bwrap {
        caps.filesystem_isolated = true;
        let mut cmd = Command::new("bwrap");
        cmd.args(bwrap_args(workspace, extra_ro_binds));
        cmd.arg(binary);
        cmd.args(args);
        cmd
    } else {
        warn!("bubblewrap (bwrap) not found, filesystem isolation disabled");
        let mut cmd = Command::new(binary);
        cmd.args(args);
        cmd.current_dir(workspace);
        cmd
    };

    cmd.env_clear();
    for (key, value) in env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mem_bytes = limits.mem_mb * 1024 * 1024;
    let nproc = limits.max_processes;
    unsafe {
        cmd.pre_exec(move || {
            set_rlimit(libc::RLIMIT_AS, mem_bytes)?;
            set_rlimit(libc::RLIMIT_NPROC, nproc)?;
            Ok(())
        });
    }
    caps.mem_capped = true;
    caps.process_capped = true;
    // CPU shares need cgroup delegation; nothing portable to do here.
    caps.cpu_capped = false;

    if strict && !caps.meets_strict_minimum() {
        return Err(LimitsError::StrictUnmet(caps));
    }

    debug!(
        "Spawning {} in {} (bwrap={}, mem={}MB, nproc={})",
        binary,
        workspace.display(),
        use_bwrap,
        limits.mem_mb,
        limits.max_processes
    );

    let child = cmd.spawn()?;
    Ok((child, caps))
}

/// Assemble the bubblewrap argument list for a workspace.
fn bwrap_args(workspace: &Path, extra_ro_binds: &[PathBuf]) -> Vec<String> {
    let mut args = Vec::new();

    for dir in &["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc"] {
        if Path::new(dir).exists() {
            args.push("--ro-bind".to_string());
            args.push(dir.to_string());
            args.push(dir.to_string());
        }
    }

    for path in extra_ro_binds {
        if path.exists() {
            let path_str = path.to_string_lossy().to_string();
            args.push("--ro-bind".to_string());
            args.push(path_str.clone());
            args.push(path_str);
        }
    }

    args.push("--proc".to_string());
    args.push("/proc".to_string());
    args.push("--dev".to_string());
    args.push("/dev".to_string());

    // Private per-sandbox /tmp.
    args.push("--tmpfs".to_string());
    args.push("/tmp".to_string());

    // Only the workspace is writable.
    let workspace_str = workspace.to_string_lossy().to_string();
    args.push("--bind".to_string());
    args.push(workspace_str.clone());
    args.push(workspace_str.clone());
    args.push("--chdir".to_string());
    args.push(workspace_str);

    args.push("--unshare-pid".to_string());
    args.push("--die-with-parent".to_string());
    args.push("--".to_string());

    args
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: called between fork and exec with a valid rlimit struct.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

// ============================================================================
// Disk monitor
// ============================================================================

/// Notice that a workspace breached its disk ceiling.
#[derive(Debug, Clone)]
pub struct DiskOverLimit {
    pub sandbox_id: String,
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

/// Recursive size of a directory, skipping unreadable entries.
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Periodically measure a workspace; one notice is sent when it exceeds the
/// ceiling, then the monitor exits. The returned handle stops the monitor
/// when aborted (sandbox destroy).
pub fn spawn_disk_monitor(
    sandbox_id: String,
    workspace: PathBuf,
    limit_mb: u64,
    interval: std::time::Duration,
    notices: mpsc::Sender<DiskOverLimit>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let limit_bytes = limit_mb * 1024 * 1024;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let dir = workspace.clone();
            let used = match tokio::task::spawn_blocking(move || dir_size(&dir)).await {
                Ok(used) => used,
                Err(_) => break,
            };
            if used > limit_bytes {
                warn!(
                    "Sandbox {} workspace at {} bytes, over the {} byte ceiling",
                    sandbox_id, used, limit_bytes
                );
                let _ = notices
                    .send(DiskOverLimit {
                        sandbox_id: sandbox_id.clone(),
                        used_bytes: used,
                        limit_bytes,
                    })
                    .await;
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_allowlist_filters_ambient_env() {
        // SAFETY: tests in this module run in one process; values restored
        // is unnecessary since keys are test-specific.
        unsafe {
            std::env::set_var("ASH_TEST_SECRET_TOKEN", "leak-me");
            std::env::set_var("ASH_MOCK_SDK", "1");
        }
        let env = allowlisted_env();
        assert!(!env.contains_key("ASH_TEST_SECRET_TOKEN"));
        assert_eq!(env.get("ASH_MOCK_SDK").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.mem_mb, 2048);
        assert_eq!(limits.cpu_percent, 100);
        assert_eq!(limits.disk_mb, 1024);
        assert_eq!(limits.max_processes, 64);
    }

    #[test]
    fn test_strict_minimum() {
        let caps = SpawnCapabilities {
            filesystem_isolated: true,
            cpu_capped: false,
            mem_capped: true,
            process_capped: false,
        };
        assert!(caps.meets_strict_minimum());

        let weak = SpawnCapabilities {
            filesystem_isolated: false,
            cpu_capped: true,
            mem_capped: true,
            process_capped: true,
        };
        assert!(!weak.meets_strict_minimum());
    }

    #[test]
    fn test_bwrap_args_shape() {
        let args = bwrap_args(Path::new("/data/sandboxes/s1"), &[]);
        assert!(args.contains(&"--unshare-pid".to_string()));
        assert!(args.contains(&"--die-with-parent".to_string()));
        assert!(args.contains(&"--tmpfs".to_string()));
        // Workspace bound read-write and used as cwd.
        let bind_idx = args
            .windows(3)
            .position(|w| w[0] == "--bind" && w[1] == "/data/sandboxes/s1")
            .expect("workspace bind missing");
        assert!(bind_idx > 0);
        assert_eq!(args.last().unwrap(), "--");
    }

    #[test]
    fn test_dir_size() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 1000]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 500]).unwrap();
        assert_eq!(dir_size(dir.path()), 1500);
    }

    #[tokio::test]
    async fn test_disk_monitor_fires_once_over_limit() {
        let dir = tempdir().unwrap();
        // 2 MB of data against a 1 MB ceiling.
        std::fs::write(dir.path().join("big"), vec![0u8; 2 * 1024 * 1024]).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_disk_monitor(
            "sbx_1".to_string(),
            dir.path().to_path_buf(),
            1,
            std::time::Duration::from_millis(10),
            tx,
        );

        let notice = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.sandbox_id, "sbx_1");
        assert!(notice.used_bytes > notice.limit_bytes);

        // Monitor exits after the first notice.
        let _ = handle.await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_limited_runs_without_bwrap_strictness() {
        // Plain spawn must work regardless of bwrap availability when strict
        // mode is off.
        let dir = tempdir().unwrap();
        let env: HashMap<String, String> =
            [("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]
                .into_iter()
                .collect();
        let (mut child, caps) = spawn_limited(
            "true",
            &[],
            dir.path(),
            &env,
            &[],
            &ResourceLimits::default(),
            false,
        )
        .unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
        assert!(caps.mem_capped);
        assert!(caps.process_capped);
    }

    #[test]
    fn test_classify_exit_normal() {
        use std::os::unix::process::ExitStatusExt;
        let caps = SpawnCapabilities {
            mem_capped: true,
            ..Default::default()
        };
        let status = std::process::ExitStatus::from_raw(0);
        assert_eq!(classify_exit(status, &caps), ExitKind::Normal(0));

        // SIGKILL with the memory cap on reads as OOM.
        let killed = std::process::ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(classify_exit(killed, &caps), ExitKind::OomKilled);

        // Without the cap it is just a signal.
        let uncapped = SpawnCapabilities::default();
        assert_eq!(
            classify_exit(killed, &uncapped),
            ExitKind::Signaled(libc::SIGKILL)
        );
    }
}
