//! Bridge wire protocol for Ash sandboxes.
//!
//! The coordinator talks to the bridge process inside each sandbox over a
//! local stream socket carrying newline-delimited JSON frames. Commands flow
//! coordinator -> bridge, events flow bridge -> coordinator. Both sides are
//! self-tagged (`cmd` / `ev`) so new tag values can be added without
//! breaking existing decoders.

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Commands (coordinator -> bridge)
// ============================================================================

/// All commands the bridge accepts, tagged by the `cmd` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum BridgeCommand {
    /// Start a query against the upstream agent SDK.
    Query {
        prompt: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_partial_messages: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Resume the upstream SDK's own session with an empty prompt.
    Resume { session_id: String },

    /// Cancel the in-flight query.
    Interrupt,

    /// Cancel, close the socket, and exit the bridge process.
    Shutdown,

    /// Run a shell command in the workspace.
    Exec {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

// ============================================================================
// Events (bridge -> coordinator)
// ============================================================================

/// Log stream origin inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Stdout,
    Stderr,
    System,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Stdout => write!(f, "stdout"),
            LogLevel::Stderr => write!(f, "stderr"),
            LogLevel::System => write!(f, "system"),
        }
    }
}

/// All events the bridge emits, tagged by the `ev` field.
///
/// `Message.data` carries one upstream-SDK message verbatim; the coordinator
/// must never reshape it on the wire. Unknown tags decode to `Unknown` so a
/// newer bridge never breaks an older client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// First frame after every accepted connection.
    Ready,

    /// One opaque upstream-SDK message.
    Message { data: Value },

    /// Query-level failure; the stream ends after this.
    Error { error: String },

    /// Query completed (also after interrupt).
    Done { session_id: String },

    /// Result of a single `exec` command.
    ExecResult {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// A log line from inside the sandbox.
    Log {
        level: LogLevel,
        text: String,
        ts: String,
    },

    /// Forward-compatibility catch-all for tags this build does not know.
    #[serde(other)]
    Unknown,
}

impl BridgeEvent {
    /// Whether this event terminates a command stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeEvent::Done { .. } | BridgeEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let cmd = BridgeCommand::Query {
            prompt: "hello".to_string(),
            session_id: "ses_1".to_string(),
            include_partial_messages: Some(true),
            model: None,
        };

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"cmd\":\"query\""));
        assert!(json.contains("\"prompt\":\"hello\""));
        assert!(!json.contains("model"));

        let parsed: BridgeCommand = serde_json::from_str(&json).unwrap();
        match parsed {
            BridgeCommand::Query {
                prompt, session_id, ..
            } => {
                assert_eq!(prompt, "hello");
                assert_eq!(session_id, "ses_1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_interrupt_is_bare() {
        let json = serde_json::to_string(&BridgeCommand::Interrupt).unwrap();
        assert_eq!(json, r#"{"cmd":"interrupt"}"#);
    }

    #[test]
    fn test_event_serialization() {
        let ev = BridgeEvent::Done {
            session_id: "ses_9".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"ev\":\"done\""));

        let ev = BridgeEvent::ExecResult {
            exit_code: 0,
            stdout: "ok\n".to_string(),
            stderr: String::new(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("exec_result"));
    }

    #[test]
    fn test_message_payload_is_opaque() {
        let raw = serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "hi"}]},
            "some_future_field": {"nested": [1, 2, 3]}
        });
        let ev = BridgeEvent::Message { data: raw.clone() };
        let json = serde_json::to_string(&ev).unwrap();
        let parsed: BridgeEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            BridgeEvent::Message { data } => assert_eq!(data, raw),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_unknown_event_tag() {
        let parsed: BridgeEvent =
            serde_json::from_str(r#"{"ev":"telemetry_v9","payload":{}}"#).unwrap();
        assert!(matches!(parsed, BridgeEvent::Unknown));
    }

    #[test]
    fn test_terminal_events() {
        assert!(BridgeEvent::Done {
            session_id: "s".into()
        }
        .is_terminal());
        assert!(BridgeEvent::Error {
            error: "boom".into()
        }
        .is_terminal());
        assert!(!BridgeEvent::Ready.is_terminal());
    }
}
