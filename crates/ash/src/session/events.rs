//! Upstream message classification.
//!
//! Turns one opaque upstream-SDK message into zero or more granular stream
//! events. The raw message is always also emitted (by the caller) as a
//! `message` frame, so classification is additive: nothing is dropped, and
//! unknown content-block kinds pass through under their original kind
//! string with their raw payload.
//!
//! Deltas are streamed but not persisted; block-level events carry the
//! timeline event type they persist under.

use serde_json::{Value, json};

use crate::store::models::EventType;

/// One granular event produced from an upstream message.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// SSE event name (`text_delta`, `tool_use`, ... or a pass-through kind).
    pub name: String,
    /// JSON payload for the SSE `data:` line.
    pub data: Value,
    /// Timeline event type to persist under, if any.
    pub persist: Option<EventType>,
}

impl StreamEvent {
    fn new(name: impl Into<String>, data: Value, persist: Option<EventType>) -> Self {
        Self {
            name: name.into(),
            data,
            persist,
        }
    }
}

/// Classify one upstream message into granular events. Deterministic, no
/// data dropped; the caller emits the raw message separately.
pub fn classify(message: &Value) -> Vec<StreamEvent> {
    match message.get("type").and_then(Value::as_str) {
        Some("stream_event") => classify_stream_event(message),
        Some("assistant") => classify_assistant(message),
        Some("user") => classify_user(message),
        Some("result") => classify_result(message),
        Some("system") => classify_system(message),
        _ => Vec::new(),
    }
}

/// Whether a message type is persisted as a message row (one row per final
/// assistant/result message, plus the user turn written on send).
pub fn is_persisted_message(message: &Value) -> bool {
    matches!(
        message.get("type").and_then(Value::as_str),
        Some("assistant") | Some("result")
    )
}

fn classify_stream_event(message: &Value) -> Vec<StreamEvent> {
    let Some(event) = message.get("event") else {
        return Vec::new();
    };
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return Vec::new();
    }
    let Some(delta) = event.get("delta") else {
        return Vec::new();
    };

    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => {
            let text = delta.get("text").cloned().unwrap_or(Value::Null);
            vec![StreamEvent::new("text_delta", json!({ "delta": text }), None)]
        }
        Some("thinking_delta") => {
            let text = delta.get("thinking").cloned().unwrap_or(Value::Null);
            vec![StreamEvent::new(
                "thinking_delta",
                json!({ "delta": text }),
                None,
            )]
        }
        _ => Vec::new(),
    }
}

fn classify_assistant(message: &Value) -> Vec<StreamEvent> {
    let blocks = message
        .pointer("/message/content")
        .or_else(|| message.get("content"))
        .and_then(Value::as_array);
    let Some(blocks) = blocks else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                events.push(StreamEvent::new(
                    "text",
                    json!({ "text": block.get("text").cloned().unwrap_or(Value::Null) }),
                    Some(EventType::Text),
                ));
            }
            Some("tool_use") => {
                events.push(StreamEvent::new(
                    "tool_use",
                    json!({
                        "id": block.get("id").cloned().unwrap_or(Value::Null),
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "input": block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    Some(EventType::ToolStart),
                ));
            }
            Some("tool_result") => {
                events.push(StreamEvent::new(
                    "tool_result",
                    tool_result_payload(block),
                    Some(EventType::ToolResult),
                ));
            }
            Some("thinking") => {
                events.push(StreamEvent::new(
                    "thinking",
                    json!({ "thinking": block.get("thinking").cloned().unwrap_or(Value::Null) }),
                    Some(EventType::Reasoning),
                ));
            }
            Some("image") => {
                events.push(StreamEvent::new(
                    "image",
                    json!({ "source": block.get("source").cloned().unwrap_or(Value::Null) }),
                    None,
                ));
            }
            Some(kind) => {
                // Forward-compatible: unknown kinds keep their tag and raw
                // payload.
                events.push(StreamEvent::new(kind, block.clone(), None));
            }
            None => {}
        }
    }
    events
}

fn classify_user(message: &Value) -> Vec<StreamEvent> {
    let blocks = message
        .pointer("/message/content")
        .or_else(|| message.get("content"))
        .and_then(Value::as_array);
    let Some(blocks) = blocks else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter(|block| {
            matches!(
                block.get("type").and_then(Value::as_str),
                Some("tool_result") | Some("tool_use_result")
            )
        })
        .map(|block| {
            StreamEvent::new(
                "tool_result",
                tool_result_payload(block),
                Some(EventType::ToolResult),
            )
        })
        .collect()
}

fn classify_result(message: &Value) -> Vec<StreamEvent> {
    vec![
        StreamEvent::new(
            "turn_complete",
            json!({
                "numTurns": message.get("num_turns").cloned().unwrap_or(Value::Null),
                "result": message.get("result").cloned().unwrap_or(Value::Null),
            }),
            Some(EventType::TurnComplete),
        ),
        // Lifecycle companion to the `session_start` emitted on init.
        StreamEvent::new(
            "session_end",
            json!({
                "sessionId": message.get("session_id").cloned().unwrap_or(Value::Null),
            }),
            Some(EventType::Lifecycle),
        ),
    ]
}

fn classify_system(message: &Value) -> Vec<StreamEvent> {
    match message.get("subtype").and_then(Value::as_str) {
        Some("init") => vec![StreamEvent::new(
            "session_start",
            message.clone(),
            Some(EventType::Lifecycle),
        )],
        _ => Vec::new(),
    }
}

fn tool_result_payload(block: &Value) -> Value {
    json!({
        "tool_use_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
        "content": block.get("content").cloned().unwrap_or(Value::Null),
        "is_error": block.get("is_error").cloned().unwrap_or(Value::Bool(false)),
    })
}

/// Concatenated visible text of an upstream message (text deltas and text
/// blocks).
pub fn extract_text(message: &Value) -> String {
    let mut out = String::new();

    if message.get("type").and_then(Value::as_str) == Some("stream_event") {
        if let Some(text) = message
            .pointer("/event/delta/text")
            .and_then(Value::as_str)
        {
            out.push_str(text);
        }
        return out;
    }

    let blocks = message
        .pointer("/message/content")
        .or_else(|| message.get("content"))
        .and_then(Value::as_array);
    if let Some(blocks) = blocks {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_delta() {
        let msg = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": { "type": "text_delta", "text": "Hel" }
            }
        });
        let events = classify(&msg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "text_delta");
        assert_eq!(events[0].data["delta"], "Hel");
        assert!(events[0].persist.is_none());
    }

    #[test]
    fn test_thinking_delta() {
        let msg = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": { "type": "thinking_delta", "thinking": "hmm" }
            }
        });
        let events = classify(&msg);
        assert_eq!(events[0].name, "thinking_delta");
        assert_eq!(events[0].data["delta"], "hmm");
    }

    #[test]
    fn test_assistant_blocks() {
        let msg = json!({
            "type": "assistant",
            "message": {
                "content": [
                    { "type": "text", "text": "Reading the file." },
                    { "type": "tool_use", "id": "tu_1", "name": "Read",
                      "input": { "path": "/x" } },
                    { "type": "thinking", "thinking": "let me check" },
                ]
            }
        });
        let events = classify(&msg);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].name, "text");
        assert_eq!(events[0].persist, Some(EventType::Text));
        assert_eq!(events[1].name, "tool_use");
        assert_eq!(events[1].data["name"], "Read");
        assert_eq!(events[1].persist, Some(EventType::ToolStart));
        assert_eq!(events[2].name, "thinking");
        assert_eq!(events[2].persist, Some(EventType::Reasoning));
    }

    #[test]
    fn test_unknown_block_kind_passes_through() {
        let msg = json!({
            "type": "assistant",
            "message": {
                "content": [
                    { "type": "server_tool_use_v2", "payload": { "k": 1 } }
                ]
            }
        });
        let events = classify(&msg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "server_tool_use_v2");
        assert_eq!(events[0].data["payload"]["k"], 1);
        assert!(events[0].persist.is_none());
    }

    #[test]
    fn test_user_tool_result() {
        let msg = json!({
            "type": "user",
            "message": {
                "content": [
                    { "type": "tool_result", "tool_use_id": "tu_1",
                      "content": "file contents", "is_error": false }
                ]
            }
        });
        let events = classify(&msg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "tool_result");
        assert_eq!(events[0].data["tool_use_id"], "tu_1");
        assert_eq!(events[0].persist, Some(EventType::ToolResult));
    }

    #[test]
    fn test_result_message() {
        let msg = json!({
            "type": "result", "num_turns": 1, "result": "done", "session_id": "ses_1"
        });
        let events = classify(&msg);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "turn_complete");
        assert_eq!(events[0].data["numTurns"], 1);
        assert_eq!(events[0].persist, Some(EventType::TurnComplete));
        // Every turn closes the session-lifecycle bracket opened by init.
        assert_eq!(events[1].name, "session_end");
        assert_eq!(events[1].data["sessionId"], "ses_1");
        assert_eq!(events[1].persist, Some(EventType::Lifecycle));
    }

    #[test]
    fn test_system_init_is_session_start() {
        let msg = json!({ "type": "system", "subtype": "init", "model": "m" });
        let events = classify(&msg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "session_start");
        assert_eq!(events[0].persist, Some(EventType::Lifecycle));
    }

    #[test]
    fn test_unknown_top_level_type_has_no_granular_events() {
        // The raw `message` frame still reaches the caller, so nothing is
        // lost.
        let msg = json!({ "type": "telemetry_v3", "data": [1, 2] });
        assert!(classify(&msg).is_empty());
    }

    #[test]
    fn test_persisted_message_types() {
        assert!(is_persisted_message(&json!({ "type": "assistant" })));
        assert!(is_persisted_message(&json!({ "type": "result" })));
        assert!(!is_persisted_message(&json!({ "type": "stream_event" })));
        assert!(!is_persisted_message(&json!({ "type": "user" })));
    }

    #[test]
    fn test_extract_text() {
        let msg = json!({
            "type": "assistant",
            "message": { "content": [
                { "type": "text", "text": "a" },
                { "type": "tool_use", "id": "x", "name": "Read", "input": {} },
                { "type": "text", "text": "b" },
            ]}
        });
        assert_eq!(extract_text(&msg), "ab");

        let delta = json!({
            "type": "stream_event",
            "event": { "type": "content_block_delta",
                       "delta": { "type": "text_delta", "text": "Hel" } }
        });
        assert_eq!(extract_text(&delta), "Hel");
    }
}
