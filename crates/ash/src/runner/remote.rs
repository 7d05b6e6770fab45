//! Remote sandbox host.
//!
//! Forwards lifecycle calls to the runner that owns a session's sandbox
//! over internal HTTP, authenticated with the shared secret. The query
//! stream tunnels bridge events through chunked transfer as NDJSON, so
//! backpressure propagates end-to-end.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use log::{debug, warn};
use std::time::Duration;

use ash_protocol::{BridgeEvent, codec};

use super::wire::{
    AliveResponse, CreateSandboxRequest, ExecRequest, FILE_SOURCE_HEADER,
    INTERNAL_SECRET_HEADER, WriteFileRequest, pack_bundle,
};
use crate::sandbox::files::FileEntry;
use crate::sandbox::manager::ExecOutcome;
use crate::session::node::{
    EventStream, FileContent, FileListing, FileSource, HostCreateOptions, HostError, QuerySpec,
    SandboxHost,
};

/// Budget for non-streaming runner calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for one runner node.
pub struct RemoteHost {
    base_url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl RemoteHost {
    pub fn new(base_url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            secret,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    fn url(&self, session_id: &str, suffix: &str) -> String {
        format!(
            "{}/api/internal/sessions/{}{}",
            self.base_url, session_id, suffix
        )
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => builder.header(INTERNAL_SECRET_HEADER, secret),
            None => builder,
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, HostError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or(body);
        Err(match status.as_u16() {
            404 => HostError::NotFound(message),
            409 => HostError::Busy,
            503 => HostError::CapacityExceeded,
            _ => HostError::Unreachable(format!("runner returned {}: {}", status, message)),
        })
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, HostError> {
        let response = self
            .authed(builder)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?;
        self.check(response).await
    }
}

#[async_trait]
impl SandboxHost for RemoteHost {
    async fn acquire(&self, opts: HostCreateOptions) -> Result<(), HostError> {
        let agent_dir = opts.agent_dir.clone();
        let bundle = tokio::task::spawn_blocking(move || pack_bundle(&agent_dir))
            .await
            .map_err(|e| HostError::Internal(e.to_string()))?
            .map_err(|e| HostError::CreateFailed(format!("bundle pack failed: {}", e)))?;

        let request = CreateSandboxRequest {
            tenant_id: opts.tenant_id,
            agent_name: opts.agent_name,
            agent_bundle_b64: bundle,
            credential_env: opts.credential_env,
            extra_env: opts.extra_env,
            startup_script: opts.startup_script,
            restore_snapshot: opts.restore_snapshot,
            workspace_bundle_b64: opts.workspace_bundle.map(|b| BASE64.encode(b)),
        };

        self.send(
            self.client
                .post(self.url(&opts.session_id, "/sandbox"))
                .json(&request),
        )
        .await?;
        Ok(())
    }

    async fn is_warm(&self, sandbox_id: &str) -> bool {
        let result = self
            .send(self.client.get(self.url(sandbox_id, "/alive")))
            .await;
        match result {
            Ok(response) => response
                .json::<AliveResponse>()
                .await
                .map(|r| r.alive)
                .unwrap_or(false),
            Err(e) => {
                debug!("Runner alive check for {} failed: {}", sandbox_id, e);
                false
            }
        }
    }

    async fn query(&self, sandbox_id: &str, spec: QuerySpec) -> Result<EventStream, HostError> {
        // No overall timeout: the stream lives as long as the turn.
        let response = self
            .authed(
                self.client
                    .post(self.url(sandbox_id, "/query"))
                    .json(&spec),
            )
            .send()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?;
        let response = self.check(response).await?;

        let mut bytes = response.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Runner query stream broke: {:?}", e);
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    if line.trim().is_empty() {
                        continue;
                    }
                    match codec::decode::<BridgeEvent>(&line) {
                        Ok(event) => yield event,
                        Err(e) => warn!("Unparseable tunneled frame: {:?}", e),
                    }
                }
            }
        }))
    }

    async fn interrupt(&self, sandbox_id: &str) -> Result<(), HostError> {
        self.send(self.client.post(self.url(sandbox_id, "/interrupt")))
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, HostError> {
        let request = ExecRequest {
            command: command.to_string(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        let response = self
            .send(
                self.client
                    .post(self.url(sandbox_id, "/exec"))
                    .json(&request),
            )
            .await?;
        response
            .json::<ExecOutcome>()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))
    }

    async fn release(&self, sandbox_id: &str) -> Result<(), HostError> {
        self.send(self.client.post(self.url(sandbox_id, "/release")))
            .await?;
        Ok(())
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), HostError> {
        self.send(self.client.delete(self.url(sandbox_id, "/sandbox")))
            .await?;
        Ok(())
    }

    async fn snapshot_archive(
        &self,
        sandbox_id: &str,
        _agent_name: &str,
    ) -> Result<Option<Vec<u8>>, HostError> {
        let response = self
            .send(self.client.post(self.url(sandbox_id, "/snapshot")))
            .await;
        match response {
            Ok(response) if response.status().as_u16() == 204 => Ok(None),
            Ok(response) => Ok(Some(
                response
                    .bytes()
                    .await
                    .map_err(|e| HostError::Unreachable(e.to_string()))?
                    .to_vec(),
            )),
            Err(HostError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_files(&self, sandbox_id: &str) -> Result<FileListing, HostError> {
        let response = self
            .send(self.client.get(self.url(sandbox_id, "/files")))
            .await?;
        #[derive(serde::Deserialize)]
        struct Listing {
            source: FileSource,
            entries: Vec<FileEntry>,
        }
        let listing: Listing = response
            .json()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?;
        Ok(FileListing {
            source: listing.source,
            entries: listing.entries,
        })
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, HostError> {
        let response = self
            .send(
                self.client
                    .get(self.url(sandbox_id, &format!("/files/{}", path))),
            )
            .await?;
        let source = match response
            .headers()
            .get(FILE_SOURCE_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some("snapshot") => FileSource::Snapshot,
            _ => FileSource::Sandbox,
        };
        let content = response
            .bytes()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?
            .to_vec();
        Ok(FileContent { source, content })
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), HostError> {
        let request = WriteFileRequest {
            path: path.to_string(),
            content_base64: BASE64.encode(content),
        };
        self.send(
            self.client
                .post(self.url(sandbox_id, "/files"))
                .json(&request),
        )
        .await?;
        Ok(())
    }

    async fn delete_file(&self, sandbox_id: &str, path: &str) -> Result<(), HostError> {
        self.send(
            self.client
                .delete(self.url(sandbox_id, &format!("/files/{}", path))),
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHost")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let host = RemoteHost::new("http://10.0.0.2:4101", None);
        assert_eq!(
            host.url("ses_1", "/query"),
            "http://10.0.0.2:4101/api/internal/sessions/ses_1/query"
        );
        assert_eq!(
            host.url("ses_1", "/files/src/main.rs"),
            "http://10.0.0.2:4101/api/internal/sessions/ses_1/files/src/main.rs"
        );
    }
}
