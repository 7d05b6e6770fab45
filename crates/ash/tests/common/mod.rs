//! Test utilities and common setup.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Once;
use tempfile::TempDir;
use tower::ServiceExt;

use ash::api::{self, AppState};
use ash::bootstrap;
use ash::config::Config;

static BRIDGE_ENV: Once = Once::new();

/// Point the sandbox manager at the freshly built bridge binary and turn on
/// the mock SDK for every sandbox (it is on the env allowlist, so resumed
/// sandboxes inherit it too).
fn ensure_bridge_binary() {
    BRIDGE_ENV.call_once(|| {
        // SAFETY: set before any test spawns a sandbox; tests only read it.
        unsafe {
            std::env::set_var("ASH_BRIDGE_BINARY", env!("CARGO_BIN_EXE_ash-bridge"));
            std::env::set_var("ASH_MOCK_SDK", "1");
        }
    });
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    #[allow(dead_code)]
    pub config: Config,
    _data: TempDir,
}

/// Build a standalone app over a temp data dir, auth disabled.
pub async fn test_app() -> TestApp {
    test_app_with(|_| {}).await
}

/// Build a standalone app with config tweaks applied.
pub async fn test_app_with(tweak: impl FnOnce(&mut Config)) -> TestApp {
    ensure_bridge_binary();

    let data = TempDir::new().unwrap();
    let mut config = Config {
        data_dir: data.path().to_path_buf(),
        max_sandboxes: 4,
        ..Default::default()
    };
    tweak(&mut config);

    let coordinator = bootstrap::build_coordinator(&config).await.unwrap();
    let state = coordinator.state.clone();
    // Background sweepers are irrelevant at test timescales.
    if let Some(stack) = coordinator.local {
        for task in stack.background {
            task.abort();
        }
    }

    TestApp {
        router: api::create_router(state.clone()),
        state,
        config,
        _data: data,
    }
}

/// A deployed agent bundle directory with the given system prompt.
pub fn agent_bundle(prompt: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("CLAUDE.md"), prompt).unwrap();
    dir
}

/// Mock-SDK env passed through to sandboxes on session create.
pub fn mock_sdk_env() -> serde_json::Map<String, Value> {
    let mut env = serde_json::Map::new();
    env.insert("ASH_MOCK_SDK".to_string(), Value::String("1".to_string()));
    env
}

impl TestApp {
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let (status, bytes) = self.raw_request(method, path, body, None).await;
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn request_with_token(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        token: &str,
    ) -> (StatusCode, Value) {
        let (status, bytes) = self.raw_request(method, path, body, Some(token)).await;
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    /// Issue a request and return the raw body (used for SSE and file
    /// reads).
    pub async fn raw_request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, bytes)
    }

    /// Deploy an agent from a bundle dir and return its name.
    pub async fn deploy_agent(&self, name: &str, bundle: &TempDir) {
        let (status, _) = self
            .request(
                "POST",
                "/api/agents",
                Some(serde_json::json!({
                    "name": name,
                    "path": bundle.path().to_string_lossy(),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    /// Create a session on the given agent with the mock SDK enabled.
    pub async fn create_session(&self, agent: &str) -> String {
        let (status, body) = self
            .request(
                "POST",
                "/api/sessions",
                Some(serde_json::json!({ "agent": agent, "env": mock_sdk_env() })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
        assert_eq!(body["session"]["status"], "active");
        body["session"]["id"].as_str().unwrap().to_string()
    }
}
