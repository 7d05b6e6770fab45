//! Server configuration.
//!
//! Every option is an `ASH_*` environment variable with a CLI flag override
//! (clap's `env` fallback). Durations are milliseconds to match the wire
//! names (`ASH_IDLE_TIMEOUT_MS` and friends).

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Execution mode for the `serve` process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ServerMode {
    /// Host sandboxes locally; runners may still register.
    #[default]
    Standalone,
    /// Never host sandboxes locally; dispatch to runners only.
    Coordinator,
}

/// Coordinator / standalone server configuration.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// HTTP bind host.
    #[arg(long, env = "ASH_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP listen port.
    #[arg(long, short, env = "ASH_PORT", default_value_t = 4100)]
    pub port: u16,

    /// Root of persisted state (workspaces, snapshots, agent bundles, DB).
    #[arg(long, env = "ASH_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Database URL; scheme selects the backend (sqlite:// or postgres://).
    /// Defaults to an embedded database under the data dir.
    #[arg(long, env = "ASH_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Fleet-wide sandbox capacity cap on this node.
    #[arg(long, env = "ASH_MAX_SANDBOXES", default_value_t = 16)]
    pub max_sandboxes: usize,

    /// Idle timeout before a sandbox is swept cold.
    #[arg(long, env = "ASH_IDLE_TIMEOUT_MS", default_value_t = 30 * 60 * 1000)]
    pub idle_timeout_ms: u64,

    /// Idle sweep interval.
    #[arg(long, env = "ASH_IDLE_SWEEP_INTERVAL_MS", default_value_t = 60 * 1000)]
    pub idle_sweep_interval_ms: u64,

    /// Age after which evicted sandbox records (and workspaces) are deleted.
    #[arg(long, env = "ASH_COLD_CLEANUP_TTL_MS", default_value_t = 2 * 60 * 60 * 1000)]
    pub cold_cleanup_ttl_ms: u64,

    /// Cold-record cleanup interval.
    #[arg(long, env = "ASH_COLD_CLEANUP_INTERVAL_MS", default_value_t = 5 * 60 * 1000)]
    pub cold_cleanup_interval_ms: u64,

    /// `standalone` (default) or `coordinator`.
    #[arg(long, env = "ASH_MODE", value_enum, default_value_t = ServerMode::Standalone)]
    pub mode: ServerMode,

    /// Shared secret for coordinator <-> runner calls.
    #[arg(long, env = "ASH_INTERNAL_SECRET")]
    pub internal_secret: Option<String>,

    /// Enables API-key auth; this key becomes the primary key.
    #[arg(long, env = "ASH_API_KEY")]
    pub api_key: Option<String>,

    /// Optional cloud snapshot backend (s3://, gs://, or http(s)://).
    #[arg(long, env = "ASH_SNAPSHOT_URL")]
    pub snapshot_url: Option<String>,

    /// Authorization header value sent with cloud snapshot requests.
    #[arg(long, env = "ASH_SNAPSHOT_AUTH", hide = true)]
    pub snapshot_auth: Option<String>,

    /// Fail sandbox spawns when isolation caps cannot all be enforced.
    #[arg(
        long,
        env = "ASH_STRICT_ISOLATION",
        value_parser = clap::builder::BoolishValueParser::new(),
        default_value = "false"
    )]
    pub strict_isolation: bool,

    /// Emit per-hop latency log lines.
    #[arg(
        long,
        env = "ASH_DEBUG_TIMING",
        value_parser = clap::builder::BoolishValueParser::new(),
        default_value = "false"
    )]
    pub debug_timing: bool,

    /// Bridge readiness timeout.
    #[arg(long, env = "ASH_READY_TIMEOUT_MS", default_value_t = 30 * 1000)]
    pub ready_timeout_ms: u64,

    /// install.sh timeout during sandbox create.
    #[arg(long, env = "ASH_INSTALL_TIMEOUT_MS", default_value_t = 2 * 60 * 1000)]
    pub install_timeout_ms: u64,

    /// Grace period between `shutdown` and force-kill.
    #[arg(long, env = "ASH_SHUTDOWN_GRACE_MS", default_value_t = 3 * 1000)]
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4100,
            data_dir: PathBuf::from("./data"),
            database_url: None,
            max_sandboxes: 16,
            idle_timeout_ms: 30 * 60 * 1000,
            idle_sweep_interval_ms: 60 * 1000,
            cold_cleanup_ttl_ms: 2 * 60 * 60 * 1000,
            cold_cleanup_interval_ms: 5 * 60 * 1000,
            mode: ServerMode::Standalone,
            internal_secret: None,
            api_key: None,
            snapshot_url: None,
            snapshot_auth: None,
            strict_isolation: false,
            debug_timing: false,
            ready_timeout_ms: 30 * 1000,
            install_timeout_ms: 2 * 60 * 1000,
            shutdown_grace_ms: 3 * 1000,
        }
    }
}

impl Config {
    /// Effective database URL (embedded file under the data dir by default).
    pub fn effective_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}?mode=rwc", self.data_dir.join("ash.db").display()),
        }
    }

    /// Directory holding deployed agent bundles.
    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }

    /// Directory holding per-session snapshot state.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding live sandbox workspaces.
    pub fn sandboxes_dir(&self) -> PathBuf {
        self.data_dir.join("sandboxes")
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Runner-mode configuration (`ash runner`).
#[derive(Debug, Clone, Args)]
pub struct RunnerConfig {
    /// Stable runner id; generated when omitted.
    #[arg(long, env = "ASH_RUNNER_ID")]
    pub id: Option<String>,

    /// Internal HTTP bind host.
    #[arg(long, env = "ASH_RUNNER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Internal HTTP listen port.
    #[arg(long, env = "ASH_RUNNER_PORT", default_value_t = 4101)]
    pub port: u16,

    /// Host the coordinator should dial back on (defaults to the bind host).
    #[arg(long, env = "ASH_RUNNER_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Coordinator base URL to register with.
    #[arg(long, env = "ASH_RUNNER_SERVER_URL", default_value = "http://127.0.0.1:4100")]
    pub server_url: String,

    /// Heartbeat interval.
    #[arg(long, env = "ASH_RUNNER_HEARTBEAT_MS", default_value_t = 10 * 1000)]
    pub heartbeat_ms: u64,
}

impl RunnerConfig {
    pub fn advertise_host(&self) -> String {
        match &self.advertise_host {
            Some(host) => host.clone(),
            None if self.host == "0.0.0.0" => "127.0.0.1".to_string(),
            None => self.host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_database_url_is_embedded() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/ash"),
            ..Default::default()
        };
        assert_eq!(
            config.effective_database_url(),
            "sqlite:///var/lib/ash/ash.db?mode=rwc"
        );
    }

    #[test]
    fn test_explicit_database_url_wins() {
        let config = Config {
            database_url: Some("postgres://ash@db/ash".to_string()),
            ..Default::default()
        };
        assert_eq!(config.effective_database_url(), "postgres://ash@db/ash");
    }

    #[test]
    fn test_runner_advertise_host_fallback() {
        let runner = RunnerConfig {
            id: None,
            host: "0.0.0.0".to_string(),
            port: 4101,
            advertise_host: None,
            server_url: "http://127.0.0.1:4100".to_string(),
            heartbeat_ms: 10_000,
        };
        assert_eq!(runner.advertise_host(), "127.0.0.1");
    }
}
