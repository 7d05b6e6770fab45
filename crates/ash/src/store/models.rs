//! Persisted data models.
//!
//! Every row carries a tenant tag (default `"default"`). Timestamps are
//! RFC 3339 strings generated in Rust so both storage backends share one
//! representation.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Current UTC timestamp in the stored representation.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Default tenant tag for rows created without one.
pub const DEFAULT_TENANT: &str = "default";

// ============================================================================
// Agents
// ============================================================================

/// A deployed agent bundle (system prompt + optional settings + optional
/// install script). Not a running process.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub tenant_id: String,
    /// Unique per tenant.
    pub name: String,
    /// Monotonic per redeploy.
    pub version: i64,
    /// Directory on disk containing CLAUDE.md and friends.
    pub path: String,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Sessions
// ============================================================================

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Sandbox is being created.
    Starting,
    /// Sandbox is live and accepting messages.
    Active,
    /// Sandbox evicted or paused; resumable.
    Paused,
    /// Explicit user stop; resumable.
    Stopped,
    /// Terminal (except via fork).
    Ended,
    /// Sandbox crashed or hit a resource cap; resumable.
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Ended => write!(f, "ended"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionStatus::Starting),
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "stopped" => Ok(SessionStatus::Stopped),
            "ended" => Ok(SessionStatus::Ended),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// One durable conversation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub agent_name: String,
    /// At most one live sandbox record at a time.
    pub sandbox_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Null means coordinator-local execution.
    pub runner_id: Option<String>,
    /// Set when the session was forked from another.
    pub parent_session_id: Option<String>,
    /// Model override forwarded to the upstream SDK.
    pub model: Option<String>,
    pub created_at: String,
    pub last_active_at: String,
}

impl Session {
    pub fn is_terminal(&self) -> bool {
        self.status == SessionStatus::Ended
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Paused | SessionStatus::Stopped | SessionStatus::Error
        )
    }
}

// ============================================================================
// Sandboxes
// ============================================================================

/// Sandbox lifecycle state.
///
/// Monotone along `cold -> warming -> warm -> waiting -> running -> waiting
/// -> ... -> cold`; `cold` is terminal for the record, the session creates a
/// fresh sandbox on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Cold,
    Warming,
    Warm,
    Waiting,
    Running,
}

impl SandboxState {
    /// States counted against the fleet capacity cap.
    pub fn is_live(&self) -> bool {
        !matches!(self, SandboxState::Cold)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxState::Cold => write!(f, "cold"),
            SandboxState::Warming => write!(f, "warming"),
            SandboxState::Warm => write!(f, "warm"),
            SandboxState::Waiting => write!(f, "waiting"),
            SandboxState::Running => write!(f, "running"),
        }
    }
}

impl std::str::FromStr for SandboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cold" => Ok(SandboxState::Cold),
            "warming" => Ok(SandboxState::Warming),
            "warm" => Ok(SandboxState::Warm),
            "waiting" => Ok(SandboxState::Waiting),
            "running" => Ok(SandboxState::Running),
            _ => Err(format!("unknown sandbox state: {}", s)),
        }
    }
}

impl TryFrom<String> for SandboxState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Durable descriptor of an isolated sandbox process.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    /// Equal to the owning session id in practice.
    pub id: String,
    pub tenant_id: String,
    /// Nullable while held in a warm pool.
    pub session_id: Option<String>,
    pub agent_name: String,
    #[sqlx(try_from = "String")]
    pub state: SandboxState,
    pub workspace_dir: String,
    /// OS pid of the bridge process, if known.
    pub pid: Option<i64>,
    pub created_at: String,
    pub last_used_at: String,
}

// ============================================================================
// Messages & timeline events
// ============================================================================

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// One persisted user or assistant turn. `content` is the raw upstream SDK
/// message, stored opaque; never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    #[sqlx(try_from = "String")]
    pub role: MessageRole,
    pub content: String,
    /// Strictly increasing per session; gaps allowed, order preserved.
    pub sequence: i64,
    pub created_at: String,
}

/// Classified timeline event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Text,
    ToolStart,
    ToolResult,
    Reasoning,
    Error,
    TurnComplete,
    Lifecycle,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Text => write!(f, "text"),
            EventType::ToolStart => write!(f, "tool_start"),
            EventType::ToolResult => write!(f, "tool_result"),
            EventType::Reasoning => write!(f, "reasoning"),
            EventType::Error => write!(f, "error"),
            EventType::TurnComplete => write!(f, "turn_complete"),
            EventType::Lifecycle => write!(f, "lifecycle"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(EventType::Text),
            "tool_start" => Ok(EventType::ToolStart),
            "tool_result" => Ok(EventType::ToolResult),
            "reasoning" => Ok(EventType::Reasoning),
            "error" => Ok(EventType::Error),
            "turn_complete" => Ok(EventType::TurnComplete),
            "lifecycle" => Ok(EventType::Lifecycle),
            _ => Err(format!("unknown event type: {}", s)),
        }
    }
}

impl TryFrom<String> for EventType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// One classified timeline entry, on its own sequence counter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: String,
    pub session_id: String,
    #[sqlx(try_from = "String")]
    pub event_type: EventType,
    /// JSON payload.
    pub data: String,
    pub sequence: i64,
    pub created_at: String,
}

// ============================================================================
// Runners
// ============================================================================

/// A registered worker node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Runner {
    pub id: String,
    pub host: String,
    pub port: i64,
    pub max_sandboxes: i64,
    pub active_count: i64,
    pub warming_count: i64,
    pub last_heartbeat_at: String,
    pub registered_at: String,
}

impl Runner {
    /// Base URL for forwarding lifecycle calls.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Slots available for new sandboxes.
    pub fn free_slots(&self) -> i64 {
        self.max_sandboxes - self.active_count - self.warming_count
    }

    /// Whether the runner heartbeated within the liveness window.
    pub fn is_live(&self, liveness: chrono::Duration) -> bool {
        match chrono::DateTime::parse_from_rfc3339(&self.last_heartbeat_at) {
            Ok(ts) => chrono::Utc::now().signed_duration_since(ts) <= liveness,
            Err(_) => false,
        }
    }
}

// ============================================================================
// API keys
// ============================================================================

/// A stored API key. Only the salted HMAC of the key material is kept.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub tenant_id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub label: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_round_trip() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Stopped,
            SessionStatus::Ended,
            SessionStatus::Error,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<SessionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_sandbox_state_liveness() {
        assert!(!SandboxState::Cold.is_live());
        assert!(SandboxState::Warming.is_live());
        assert!(SandboxState::Warm.is_live());
        assert!(SandboxState::Waiting.is_live());
        assert!(SandboxState::Running.is_live());
    }

    #[test]
    fn test_event_type_round_trip() {
        for ty in [
            EventType::Text,
            EventType::ToolStart,
            EventType::ToolResult,
            EventType::Reasoning,
            EventType::Error,
            EventType::TurnComplete,
            EventType::Lifecycle,
        ] {
            assert_eq!(ty.to_string().parse::<EventType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_runner_free_slots() {
        let runner = Runner {
            id: "r1".into(),
            host: "10.0.0.2".into(),
            port: 4101,
            max_sandboxes: 8,
            active_count: 3,
            warming_count: 1,
            last_heartbeat_at: now_rfc3339(),
            registered_at: now_rfc3339(),
        };
        assert_eq!(runner.free_slots(), 4);
        assert!(runner.is_live(chrono::Duration::seconds(30)));
        assert_eq!(runner.base_url(), "http://10.0.0.2:4101");
    }

    #[test]
    fn test_runner_stale_heartbeat() {
        let old = (chrono::Utc::now() - chrono::Duration::seconds(120)).to_rfc3339();
        let runner = Runner {
            id: "r2".into(),
            host: "h".into(),
            port: 1,
            max_sandboxes: 1,
            active_count: 0,
            warming_count: 0,
            last_heartbeat_at: old,
            registered_at: now_rfc3339(),
        };
        assert!(!runner.is_live(chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!("sleeping".parse::<SessionStatus>().is_err());
        assert!("hot".parse::<SandboxState>().is_err());
    }
}
