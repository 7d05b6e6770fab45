//! Agent bundle management.
//!
//! An agent is a deployed bundle on disk (`CLAUDE.md` plus optional
//! `.mcp.json`, `.claude/settings.json`, and `install.sh`), not a running
//! process. Deploy copies the bundle under the data dir and inserts a row;
//! redeploy replaces the bundle and bumps the version.

use log::info;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::runner::wire::unpack_bundle;
use crate::sandbox::files::{self, FileEntry, FileError};
use crate::store::models::Agent;
use crate::store::{SharedStore, StoreError};

/// Agent service failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("agent already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid agent bundle: {0}")]
    InvalidBundle(String),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a deploy's bundle comes from.
#[derive(Debug, Clone)]
pub enum AgentSource {
    /// Server-local directory to copy from.
    LocalPath(PathBuf),
    /// Uploaded base64 tar.gz.
    Bundle(String),
}

/// Deploy, redeploy, and serve agent bundles.
pub struct AgentService {
    store: SharedStore,
    agents_dir: PathBuf,
}

impl AgentService {
    pub fn new(store: SharedStore, agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            agents_dir: agents_dir.into(),
        }
    }

    /// On-disk bundle directory for an agent.
    pub fn bundle_dir(&self, tenant_id: &str, name: &str) -> PathBuf {
        self.agents_dir.join(tenant_id).join(name)
    }

    /// Deploy a new agent. Fails when the name is taken for this tenant.
    pub async fn deploy(
        &self,
        tenant_id: &str,
        name: &str,
        source: AgentSource,
    ) -> Result<Agent, AgentError> {
        validate_agent_name(name)?;
        if self.store.get_agent(tenant_id, name).await?.is_some() {
            return Err(AgentError::AlreadyExists(name.to_string()));
        }
        self.install_bundle(tenant_id, name, source).await
    }

    /// Redeploy an existing agent, bumping its version.
    pub async fn redeploy(
        &self,
        tenant_id: &str,
        name: &str,
        source: AgentSource,
    ) -> Result<Agent, AgentError> {
        if self.store.get_agent(tenant_id, name).await?.is_none() {
            return Err(AgentError::NotFound(name.to_string()));
        }
        self.install_bundle(tenant_id, name, source).await
    }

    async fn install_bundle(
        &self,
        tenant_id: &str,
        name: &str,
        source: AgentSource,
    ) -> Result<Agent, AgentError> {
        let dest = self.bundle_dir(tenant_id, name);

        // Stage into a sibling dir first so a bad bundle never clobbers the
        // previous deploy.
        let staging = dest.with_extension("staging");
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }

        match source {
            AgentSource::LocalPath(path) => {
                if !path.is_dir() {
                    return Err(AgentError::InvalidBundle(format!(
                        "not a directory: {}",
                        path.display()
                    )));
                }
                let staging_dir = staging.clone();
                tokio::task::spawn_blocking(move || copy_tree(&path, &staging_dir))
                    .await
                    .map_err(|e| std::io::Error::other(e.to_string()))??;
            }
            AgentSource::Bundle(bundle_b64) => {
                let staging_dir = staging.clone();
                tokio::task::spawn_blocking(move || unpack_bundle(&bundle_b64, &staging_dir))
                    .await
                    .map_err(|e| std::io::Error::other(e.to_string()))?
                    .map_err(|e| AgentError::InvalidBundle(e.to_string()))?;
            }
        }

        if !staging.join("CLAUDE.md").is_file() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(AgentError::InvalidBundle(
                "bundle has no CLAUDE.md".to_string(),
            ));
        }

        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&staging, &dest).await?;

        let agent = self
            .store
            .upsert_agent(tenant_id, name, &dest.to_string_lossy())
            .await?;
        info!(
            "Deployed agent {} v{} for tenant {}",
            agent.name, agent.version, tenant_id
        );
        Ok(agent)
    }

    pub async fn get(&self, tenant_id: &str, name: &str) -> Result<Option<Agent>, AgentError> {
        Ok(self.store.get_agent(tenant_id, name).await?)
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<Agent>, AgentError> {
        Ok(self.store.list_agents(tenant_id).await?)
    }

    /// Delete the agent row and its bundle. Live sessions keep their copied
    /// workspaces.
    pub async fn delete(&self, tenant_id: &str, name: &str) -> Result<(), AgentError> {
        match self.store.delete_agent(tenant_id, name).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(AgentError::NotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        }
        let dir = self.bundle_dir(tenant_id, name);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// List bundle files.
    pub async fn list_files(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Vec<FileEntry>, AgentError> {
        if self.store.get_agent(tenant_id, name).await?.is_none() {
            return Err(AgentError::NotFound(name.to_string()));
        }
        let dir = self.bundle_dir(tenant_id, name);
        Ok(tokio::task::spawn_blocking(move || files::list_files(&dir))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??)
    }

    /// Read one bundle file.
    pub async fn read_file(
        &self,
        tenant_id: &str,
        name: &str,
        path: &str,
    ) -> Result<Vec<u8>, AgentError> {
        if self.store.get_agent(tenant_id, name).await?.is_none() {
            return Err(AgentError::NotFound(name.to_string()));
        }
        let dir = self.bundle_dir(tenant_id, name);
        Ok(files::read_file(&dir, path)?)
    }
}

fn validate_agent_name(name: &str) -> Result<(), AgentError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AgentError::InvalidBundle(format!(
            "invalid agent name: {}",
            name
        )))
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn service(agents_dir: &Path) -> AgentService {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        AgentService::new(store, agents_dir)
    }

    fn bundle_source(content: &str) -> (tempfile::TempDir, AgentSource) {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), content).unwrap();
        let source = AgentSource::LocalPath(dir.path().to_path_buf());
        (dir, source)
    }

    #[tokio::test]
    async fn test_deploy_and_redeploy() {
        let data = tempdir().unwrap();
        let service = service(data.path()).await;
        let (_src, source) = bundle_source("You answer questions.");

        let agent = service.deploy("default", "qa-bot", source.clone()).await.unwrap();
        assert_eq!(agent.version, 1);
        assert!(
            service
                .bundle_dir("default", "qa-bot")
                .join("CLAUDE.md")
                .is_file()
        );

        // Second deploy with the same name conflicts.
        assert!(matches!(
            service.deploy("default", "qa-bot", source.clone()).await,
            Err(AgentError::AlreadyExists(_))
        ));

        let agent = service.redeploy("default", "qa-bot", source).await.unwrap();
        assert_eq!(agent.version, 2);
    }

    #[tokio::test]
    async fn test_deploy_requires_claude_md() {
        let data = tempdir().unwrap();
        let service = service(data.path()).await;
        let empty = tempdir().unwrap();

        let result = service
            .deploy(
                "default",
                "bot",
                AgentSource::LocalPath(empty.path().to_path_buf()),
            )
            .await;
        assert!(matches!(result, Err(AgentError::InvalidBundle(_))));
        assert!(service.get("default", "bot").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let data = tempdir().unwrap();
        let service = service(data.path()).await;
        let (_src, source) = bundle_source("prompt");
        service.deploy("default", "bot", source).await.unwrap();

        service.delete("default", "bot").await.unwrap();
        assert!(!service.bundle_dir("default", "bot").exists());
        assert!(matches!(
            service.delete("default", "bot").await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bundle_files() {
        let data = tempdir().unwrap();
        let service = service(data.path()).await;
        let (_src, source) = bundle_source("prompt");
        service.deploy("default", "bot", source).await.unwrap();

        let entries = service.list_files("default", "bot").await.unwrap();
        assert!(entries.iter().any(|e| e.path == "CLAUDE.md"));

        let content = service.read_file("default", "bot", "CLAUDE.md").await.unwrap();
        assert_eq!(content, b"prompt");
    }

    #[test]
    fn test_agent_name_validation() {
        assert!(validate_agent_name("qa-bot_2").is_ok());
        assert!(validate_agent_name("").is_err());
        assert!(validate_agent_name("has space").is_err());
        assert!(validate_agent_name("dots.are.out").is_err());
    }
}
