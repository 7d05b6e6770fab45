//! Coordinator <-> runner internal wire types.
//!
//! Agent bundles travel with the create call as base64 tar.gz so runners
//! need no shared filesystem with the coordinator.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Internal auth header checked on every runner/internal route.
pub const INTERNAL_SECRET_HEADER: &str = "x-ash-internal-secret";

/// Source tag header on raw file reads.
pub const FILE_SOURCE_HEADER: &str = "x-ash-file-source";

// ============================================================================
// Registration & heartbeat (runner -> coordinator)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub id: String,
    pub host: String,
    pub port: i64,
    pub max_sandboxes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub id: String,
    pub active_count: i64,
    pub warming_count: i64,
}

// ============================================================================
// Sandbox lifecycle (coordinator -> runner)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    pub tenant_id: String,
    pub agent_name: String,
    /// tar.gz of the agent bundle directory.
    pub agent_bundle_b64: String,
    #[serde(default)]
    pub credential_env: HashMap<String, String>,
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
    #[serde(default)]
    pub startup_script: Option<String>,
    #[serde(default)]
    pub restore_snapshot: bool,
    /// Seed snapshot (fork): tar.gz imported into the runner's snapshot
    /// store before the workspace is restored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_bundle_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliveResponse {
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileRequest {
    pub path: String,
    pub content_base64: String,
}

// ============================================================================
// Bundle packing
// ============================================================================

/// Pack a directory into base64 tar.gz.
pub fn pack_bundle(dir: &Path) -> std::io::Result<String> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", dir)?;
    let bytes = builder.into_inner()?.finish()?;
    Ok(BASE64.encode(bytes))
}

/// Unpack a base64 tar.gz into a directory.
pub fn unpack_bundle(bundle_b64: &str, dest: &Path) -> std::io::Result<()> {
    let bytes = BASE64
        .decode(bundle_b64)
        .map_err(std::io::Error::other)?;
    std::fs::create_dir_all(dest)?;
    let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bundle_round_trip() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("CLAUDE.md"), "You answer questions.").unwrap();
        std::fs::create_dir_all(src.path().join(".claude")).unwrap();
        std::fs::write(src.path().join(".claude/settings.json"), "{}").unwrap();

        let bundle = pack_bundle(src.path()).unwrap();

        let dest = tempdir().unwrap();
        unpack_bundle(&bundle, dest.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.path().join("CLAUDE.md")).unwrap(),
            "You answer questions."
        );
        assert!(dest.path().join(".claude/settings.json").exists());
    }

    #[test]
    fn test_request_shapes() {
        let req = CreateSandboxRequest {
            tenant_id: "default".to_string(),
            agent_name: "qa-bot".to_string(),
            agent_bundle_b64: "AAAA".to_string(),
            credential_env: HashMap::new(),
            extra_env: HashMap::new(),
            startup_script: None,
            restore_snapshot: true,
            workspace_bundle_b64: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"agentName\":\"qa-bot\""));
        assert!(json.contains("\"restoreSnapshot\":true"));

        let parsed: CreateSandboxRequest =
            serde_json::from_str(r#"{"tenantId":"t","agentName":"a","agentBundleB64":""}"#)
                .unwrap();
        assert!(!parsed.restore_snapshot);
    }
}
