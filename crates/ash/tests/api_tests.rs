//! Router-level integration tests.
//!
//! Sessions run real sandboxes (no namespace isolation in CI) with the
//! bridge's mock SDK, so message streams are deterministic.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{agent_bundle, mock_sdk_env, test_app, test_app_with};

#[tokio::test]
async fn test_health_is_open() {
    let app = test_app().await;
    let (status, body) = app.request("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_metrics_reports_pool() {
    let app = test_app().await;
    let (status, body) = app.request("GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool"]["capacity"], 4);
    assert_eq!(body["runners"]["registered"], 0);
}

// ============================================================================
// Agents
// ============================================================================

#[tokio::test]
async fn test_agent_deploy_lifecycle() {
    let app = test_app().await;
    let bundle = agent_bundle("You answer questions.");

    app.deploy_agent("qa-bot", &bundle).await;

    let (status, body) = app.request("GET", "/api/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents"][0]["name"], "qa-bot");
    assert_eq!(body["agents"][0]["version"], 1);

    // Redeploy bumps the version.
    let (status, body) = app
        .request(
            "PATCH",
            "/api/agents/qa-bot",
            Some(json!({ "path": bundle.path().to_string_lossy() })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agent"]["version"], 2);

    // Bundle files are browsable.
    let (status, body) = app.request("GET", "/api/agents/qa-bot/files", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["files"]
        .as_array()
        .unwrap()
        .iter()
        .any(|f| f["path"] == "CLAUDE.md"));

    let (status, bytes) = app
        .raw_request("GET", "/api/agents/qa-bot/files/CLAUDE.md", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"You answer questions.");

    let (status, _) = app.request("DELETE", "/api/agents/qa-bot", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.request("GET", "/api/agents/qa-bot", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_deploy_conflicts_and_validation() {
    let app = test_app().await;
    let bundle = agent_bundle("prompt");
    app.deploy_agent("bot", &bundle).await;

    // Same name again conflicts.
    let (status, _) = app
        .request(
            "POST",
            "/api/agents",
            Some(json!({ "name": "bot", "path": bundle.path().to_string_lossy() })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Bundle without CLAUDE.md is rejected.
    let empty = tempfile::TempDir::new().unwrap();
    let (status, _) = app
        .request(
            "POST",
            "/api/agents",
            Some(json!({ "name": "other", "path": empty.path().to_string_lossy() })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_deploy_create_send_end() {
    let app = test_app().await;
    let bundle = agent_bundle("You answer questions.");
    app.deploy_agent("qa-bot", &bundle).await;

    let session_id = app.create_session("qa-bot").await;

    // Send one message; collect the SSE stream.
    let (status, body) = app
        .raw_request(
            "POST",
            &format!("/api/sessions/{session_id}/messages"),
            Some(json!({ "content": "hi" })),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let sse = String::from_utf8(body).unwrap();
    assert!(sse.contains("event: message"), "no raw message frame: {sse}");
    assert!(sse.contains("event: text"), "no granular text frame: {sse}");
    assert!(sse.contains("event: turn_complete"));
    assert_eq!(sse.matches("event: done").count(), 1);

    // History: the user turn plus the assistant/result rows, in order.
    let (status, body) = app
        .request("GET", &format!("/api/sessions/{session_id}/messages"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let messages = body["messages"].as_array().unwrap();
    assert!(messages.len() >= 2);
    assert_eq!(messages[0]["role"], "user");
    let mut last_seq = 0;
    for message in messages {
        let seq = message["sequence"].as_i64().unwrap();
        assert!(seq > last_seq, "sequences must strictly increase");
        last_seq = seq;
    }

    // Timeline events exist with their own increasing counter.
    let (status, body) = app
        .request("GET", &format!("/api/sessions/{session_id}/events"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["eventType"] == "text"));
    assert!(events.iter().any(|e| e["eventType"] == "turn_complete"));

    // End is terminal.
    let (status, body) = app
        .request("DELETE", &format!("/api/sessions/{session_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["status"], "ended");

    let (status, _) = app
        .request(
            "POST",
            &format!("/api/sessions/{session_id}/resume"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_pause_then_resume_keeps_workspace() {
    let app = test_app().await;
    let bundle = agent_bundle("prompt");
    app.deploy_agent("bot", &bundle).await;
    let session_id = app.create_session("bot").await;

    // Write a file via exec, through the bridge.
    let (status, body) = app
        .request(
            "POST",
            &format!("/api/sessions/{session_id}/exec"),
            Some(json!({ "command": "printf TOP > secret.txt" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "exec failed: {body}");
    assert_eq!(body["exitCode"], 0);

    let (status, body) = app
        .request("POST", &format!("/api/sessions/{session_id}/pause"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["status"], "paused");

    // Paused: file reads fall back to the snapshot.
    let (status, bytes) = app
        .raw_request(
            "GET",
            &format!("/api/sessions/{session_id}/files/secret.txt"),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"TOP");

    // Resume brings the workspace back.
    let (status, body) = app
        .request("POST", &format!("/api/sessions/{session_id}/resume"), None)
        .await;
    assert_eq!(status, StatusCode::OK, "resume failed: {body}");
    assert_eq!(body["session"]["status"], "active");
    assert_eq!(body["session"]["sandboxId"], json!(session_id));

    let (status, body) = app
        .request(
            "POST",
            &format!("/api/sessions/{session_id}/exec"),
            Some(json!({ "command": "cat secret.txt" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exitCode"], 0);
    assert_eq!(body["stdout"], "TOP");

    // Resuming an active session is an idempotent no-op.
    let (status, body) = app
        .request("POST", &format!("/api/sessions/{session_id}/resume"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["status"], "active");
}

#[tokio::test]
async fn test_pause_requires_active() {
    let app = test_app().await;
    let bundle = agent_bundle("prompt");
    app.deploy_agent("bot", &bundle).await;
    let session_id = app.create_session("bot").await;

    let (status, _) = app
        .request("POST", &format!("/api/sessions/{session_id}/pause"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    // Pausing a paused session is an invalid state transition.
    let (status, _) = app
        .request("POST", &format!("/api/sessions/{session_id}/pause"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_concurrent_send_is_rejected() {
    let app = test_app().await;
    let bundle = agent_bundle("prompt");
    app.deploy_agent("bot", &bundle).await;

    // Slow the mock stream down so the first send is still streaming.
    let mut env = mock_sdk_env();
    env.insert(
        "ASH_MOCK_SDK_DELAY_MS".to_string(),
        json!("200"),
    );
    let (status, body) = app
        .request(
            "POST",
            "/api/sessions",
            Some(json!({ "agent": "bot", "env": env })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = body["session"]["id"].as_str().unwrap().to_string();

    let first = {
        let app_path = format!("/api/sessions/{session_id}/messages");
        let router = app.router.clone();
        tokio::spawn(async move {
            use http_body_util::BodyExt;
            use tower::ServiceExt;
            let request = axum::http::Request::builder()
                .method("POST")
                .uri(app_path)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({ "content": "slow one" }).to_string(),
                ))
                .unwrap();
            let response = router.oneshot(request).await.unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, String::from_utf8_lossy(&body).to_string())
        })
    };

    // Give the first request time to open its stream.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let (status, body) = app
        .request(
            "POST",
            &format!("/api/sessions/{session_id}/messages"),
            Some(json!({ "content": "second" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "expected busy: {body}");
    assert_eq!(body["code"], "BUSY");

    // The first stream completes normally.
    let (status, sse) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(sse.contains("event: done"));
}

#[tokio::test]
async fn test_capacity_evicts_lru() {
    let app = test_app_with(|config| {
        config.max_sandboxes = 1;
    })
    .await;
    let bundle = agent_bundle("prompt");
    app.deploy_agent("bot", &bundle).await;

    let first = app.create_session("bot").await;
    // The second create evicts the idle first sandbox.
    let _second = app.create_session("bot").await;

    let (status, body) = app
        .request("GET", &format!("/api/sessions/{first}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["status"], "paused");

    let (_, body) = app.request("GET", "/metrics", None).await;
    assert!(body["pool"]["warm"].as_u64().unwrap() + body["pool"]["waiting"].as_u64().unwrap() <= 1);
}

#[tokio::test]
async fn test_fork_copies_history_and_workspace() {
    let app = test_app().await;
    let bundle = agent_bundle("prompt");
    app.deploy_agent("bot", &bundle).await;
    let parent = app.create_session("bot").await;

    // Seed workspace + history.
    let (status, _) = app
        .request(
            "POST",
            &format!("/api/sessions/{parent}/exec"),
            Some(json!({ "command": "printf inherited > note.txt" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app
        .raw_request(
            "POST",
            &format!("/api/sessions/{parent}/messages"),
            Some(json!({ "content": "remember this" })),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .request("POST", &format!("/api/sessions/{parent}/fork"), None)
        .await;
    assert_eq!(status, StatusCode::CREATED, "fork failed: {body}");
    let child = body["session"]["id"].as_str().unwrap().to_string();
    assert_ne!(child, parent);
    assert_eq!(body["session"]["parentSessionId"], json!(parent));
    assert_eq!(body["session"]["status"], "active");

    // Parent untouched.
    let (_, body) = app
        .request("GET", &format!("/api/sessions/{parent}"), None)
        .await;
    assert_eq!(body["session"]["status"], "active");

    // Child inherited the messages and the workspace file.
    let (_, body) = app
        .request("GET", &format!("/api/sessions/{child}/messages"), None)
        .await;
    assert!(!body["messages"].as_array().unwrap().is_empty());

    let (status, body) = app
        .request(
            "POST",
            &format!("/api/sessions/{child}/exec"),
            Some(json!({ "command": "cat note.txt" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stdout"], "inherited");
}

#[tokio::test]
async fn test_session_listing_filters() {
    let app = test_app().await;
    let bundle = agent_bundle("prompt");
    app.deploy_agent("alpha", &bundle).await;
    app.deploy_agent("beta", &bundle).await;

    let a = app.create_session("alpha").await;
    let _b = app.create_session("beta").await;
    let (status, _) = app
        .request("POST", &format!("/api/sessions/{a}/stop"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app.request("GET", "/api/sessions?agent=alpha", None).await;
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    let (_, body) = app
        .request("GET", "/api/sessions?status=stopped", None)
        .await;
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);
    assert_eq!(body["sessions"][0]["id"], json!(a));

    let (_, body) = app.request("GET", "/api/sessions?limit=1", None).await;
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_session_for_unknown_agent_is_404() {
    let app = test_app().await;
    let (status, _) = app
        .request("POST", "/api/sessions", Some(json!({ "agent": "ghost" })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Files
// ============================================================================

#[tokio::test]
async fn test_file_upload_and_traversal_guard() {
    let app = test_app().await;
    let bundle = agent_bundle("prompt");
    app.deploy_agent("bot", &bundle).await;
    let session_id = app.create_session("bot").await;

    use base64::Engine;
    let content = base64::engine::general_purpose::STANDARD.encode("uploaded");
    let (status, _) = app
        .request(
            "POST",
            &format!("/api/sessions/{session_id}/files"),
            Some(json!({ "path": "docs/readme.md", "contentBase64": content })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, bytes) = app
        .raw_request(
            "GET",
            &format!("/api/sessions/{session_id}/files/docs/readme.md"),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"uploaded");

    // Traversal is rejected before touching the filesystem.
    let err = app
        .state
        .sessions
        .read_file("default", &session_id, "../../etc/passwd")
        .await;
    assert!(err.is_err());

    let (status, _) = app
        .raw_request(
            "DELETE",
            &format!("/api/sessions/{session_id}/files/docs/readme.md"),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Auth
// ============================================================================

#[tokio::test]
async fn test_api_key_auth() {
    let app = test_app_with(|config| {
        config.api_key = Some("sk-ash-test-key".to_string());
    })
    .await;

    // Health stays open.
    let (status, _) = app.request("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    // API routes require the key.
    let (status, _) = app.request("GET", "/api/agents", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request_with_token("GET", "/api/agents", None, "wrong-key")
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .request_with_token("GET", "/api/agents", None, "sk-ash-test-key")
        .await;
    assert_eq!(status, StatusCode::OK, "valid key rejected: {body}");
}

// ============================================================================
// Runners
// ============================================================================

#[tokio::test]
async fn test_runner_registration_and_heartbeat() {
    let app = test_app().await;

    let (status, body) = app
        .request(
            "POST",
            "/api/internal/runners/register",
            Some(json!({ "id": "r1", "host": "10.0.0.2", "port": 4101, "maxSandboxes": 8 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runner"]["id"], "r1");

    let (status, _) = app
        .request(
            "POST",
            "/api/internal/runners/heartbeat",
            Some(json!({ "id": "r1", "activeCount": 2, "warmingCount": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.request("GET", "/api/internal/runners", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runners"][0]["activeCount"], 2);

    // Heartbeat for an unregistered runner is a 404.
    let (status, _) = app
        .request(
            "POST",
            "/api/internal/runners/heartbeat",
            Some(json!({ "id": "ghost", "activeCount": 0, "warmingCount": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_internal_routes_require_secret() {
    let app = test_app_with(|config| {
        config.internal_secret = Some("wire-secret".to_string());
    })
    .await;

    let (status, _) = app
        .request(
            "POST",
            "/api/internal/runners/register",
            Some(json!({ "id": "r1", "host": "h", "port": 1, "maxSandboxes": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
