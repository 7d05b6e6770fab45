//! Workspace snapshot store.
//!
//! Whole-workspace persistence keyed by session id. The local snapshot
//! directory is the source of truth; an optional cloud mirror (tar.gz in an
//! object store) is a durability tier consulted on cold resume when the
//! local copy is missing.
//!
//! Persistence is best-effort: failures are logged and reported as `false`,
//! never propagated as lifecycle failures.

mod cloud;

pub use cloud::CloudMirror;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::store::models::now_rfc3339;

/// Directory names never captured in a snapshot (regeneratable).
const EXCLUDED_NAMES: &[&str] = &[
    "node_modules",
    ".git",
    ".venv",
    "venv",
    "__pycache__",
    ".cache",
    "target",
    ".tmp",
];

/// File extensions never captured (ephemeral runtime state).
const EXCLUDED_EXTENSIONS: &[&str] = &["sock", "lock", "pid"];

/// Whether a single path component is excluded from snapshots.
pub fn is_excluded(name: &str) -> bool {
    if EXCLUDED_NAMES.contains(&name) {
        return true;
    }
    match name.rsplit_once('.') {
        Some((_, ext)) => EXCLUDED_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// Sidecar written next to every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub session_id: String,
    pub agent_name: String,
    pub persisted_at: String,
}

/// Local snapshot store with an optional cloud mirror.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    /// `<data-dir>/sessions`.
    root: PathBuf,
    cloud: Option<CloudMirror>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, cloud: Option<CloudMirror>) -> Self {
        Self {
            root: root.into(),
            cloud,
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn workspace_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("workspace")
    }

    fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("metadata.json")
    }

    fn archive_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("workspace.tar.gz")
    }

    /// Capture the workspace into the local snapshot (and mirror to cloud
    /// when configured). Returns `false` on any failure.
    pub async fn persist(
        &self,
        session_id: &str,
        workspace_dir: &Path,
        agent_name: &str,
    ) -> bool {
        let snapshot_dir = self.workspace_dir(session_id);
        let workspace = workspace_dir.to_path_buf();

        // Replace the previous capture wholesale so deletions propagate.
        if snapshot_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&snapshot_dir).await {
                warn!("Failed to clear previous snapshot for {}: {:?}", session_id, e);
                return false;
            }
        }

        let dest = snapshot_dir.clone();
        let copied =
            tokio::task::spawn_blocking(move || copy_filtered(&workspace, &dest)).await;
        match copied {
            Ok(Ok(files)) => {
                debug!("Snapshot of {} captured {} files", session_id, files);
            }
            Ok(Err(e)) => {
                warn!("Snapshot copy failed for {}: {:?}", session_id, e);
                return false;
            }
            Err(e) => {
                warn!("Snapshot task panicked for {}: {:?}", session_id, e);
                return false;
            }
        }

        let metadata = SnapshotMetadata {
            session_id: session_id.to_string(),
            agent_name: agent_name.to_string(),
            persisted_at: now_rfc3339(),
        };
        let json = match serde_json::to_vec_pretty(&metadata) {
            Ok(json) => json,
            Err(e) => {
                warn!("Snapshot metadata serialization failed: {:?}", e);
                return false;
            }
        };
        if let Err(e) = tokio::fs::write(self.metadata_path(session_id), json).await {
            warn!("Snapshot metadata write failed for {}: {:?}", session_id, e);
            return false;
        }

        if let Some(ref cloud) = self.cloud {
            let archive = self.archive_path(session_id);
            let ok = cloud
                .upload(session_id, &snapshot_dir, &archive)
                .await;
            // The archive is transient; remove it regardless of outcome.
            let _ = tokio::fs::remove_file(&archive).await;
            if !ok {
                warn!("Cloud mirror upload failed for {} (local snapshot kept)", session_id);
            }
        }

        info!("Persisted snapshot for session {}", session_id);
        true
    }

    /// Restore the snapshot into `target_dir`. Tries local state first, then
    /// downloads from the cloud mirror. Returns `false` if no snapshot
    /// exists anywhere.
    pub async fn restore(&self, session_id: &str, target_dir: &Path) -> bool {
        let snapshot_dir = self.workspace_dir(session_id);

        if !snapshot_dir.exists() {
            let Some(ref cloud) = self.cloud else {
                return false;
            };
            let archive = self.archive_path(session_id);
            if let Some(parent) = archive.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if !cloud.download(session_id, &archive, &snapshot_dir).await {
                return false;
            }
            let _ = tokio::fs::remove_file(&archive).await;
            info!("Recovered snapshot for {} from cloud mirror", session_id);
        }

        let src = snapshot_dir.clone();
        let dest = target_dir.to_path_buf();
        match tokio::task::spawn_blocking(move || copy_filtered(&src, &dest)).await {
            Ok(Ok(files)) => {
                info!("Restored snapshot for {} ({} files)", session_id, files);
                true
            }
            Ok(Err(e)) => {
                warn!("Snapshot restore failed for {}: {:?}", session_id, e);
                false
            }
            Err(e) => {
                warn!("Snapshot restore task panicked for {}: {:?}", session_id, e);
                false
            }
        }
    }

    /// Whether a local snapshot exists for the session.
    pub async fn has(&self, session_id: &str) -> bool {
        self.workspace_dir(session_id).exists()
    }

    /// Read the metadata sidecar, if present.
    pub async fn metadata(&self, session_id: &str) -> Option<SnapshotMetadata> {
        let bytes = tokio::fs::read(self.metadata_path(session_id)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Path to the snapshotted workspace (for snapshot-sourced file reads).
    pub fn snapshot_workspace(&self, session_id: &str) -> PathBuf {
        self.workspace_dir(session_id)
    }

    /// Pack the local snapshot into tar.gz bytes (fork transfer). Returns
    /// `None` when no snapshot exists or packing fails.
    pub async fn export_archive(&self, session_id: &str) -> Option<Vec<u8>> {
        let dir = self.workspace_dir(session_id);
        if !dir.exists() {
            return None;
        }
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(".", &dir)?;
            Ok(builder.into_inner()?.finish()?)
        })
        .await;
        match result {
            Ok(Ok(bytes)) => Some(bytes),
            Ok(Err(e)) => {
                warn!("Snapshot export failed for {}: {:?}", session_id, e);
                None
            }
            Err(e) => {
                warn!("Snapshot export task panicked for {}: {:?}", session_id, e);
                None
            }
        }
    }

    /// Unpack tar.gz bytes as this session's snapshot (fork transfer).
    pub async fn import_archive(
        &self,
        session_id: &str,
        bytes: Vec<u8>,
        agent_name: &str,
    ) -> bool {
        let dir = self.workspace_dir(session_id);
        if dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to clear snapshot for import of {}: {:?}", session_id, e);
                return false;
            }
        }
        let dest = dir.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dest)?;
            let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&dest)?;
            Ok(())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Snapshot import failed for {}: {:?}", session_id, e);
                return false;
            }
            Err(e) => {
                warn!("Snapshot import task panicked for {}: {:?}", session_id, e);
                return false;
            }
        }

        let metadata = SnapshotMetadata {
            session_id: session_id.to_string(),
            agent_name: agent_name.to_string(),
            persisted_at: now_rfc3339(),
        };
        match serde_json::to_vec_pretty(&metadata) {
            Ok(json) => tokio::fs::write(self.metadata_path(session_id), json)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Delete the snapshot locally and from the cloud mirror.
    pub async fn delete(&self, session_id: &str) -> bool {
        let dir = self.session_dir(session_id);
        let mut ok = true;
        if dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to delete snapshot for {}: {:?}", session_id, e);
                ok = false;
            }
        }
        if let Some(ref cloud) = self.cloud {
            ok &= cloud.delete(session_id).await;
        }
        ok
    }
}

/// Recursive filtered copy. Returns the number of files copied.
fn copy_filtered(src: &Path, dest: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(dest)?;
    let mut copied = 0;

    let walker = walkdir::WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| !is_excluded(name))
                .unwrap_or(true)
        });

    for entry in walker {
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
            copied += 1;
        }
        // Symlinks are skipped: they may point outside the workspace.
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_exclusion_rules() {
        assert!(is_excluded("node_modules"));
        assert!(is_excluded(".git"));
        assert!(is_excluded("server.sock"));
        assert!(is_excluded("install.lock"));
        assert!(is_excluded("bridge.pid"));
        assert!(!is_excluded("src"));
        assert!(!is_excluded("main.rs"));
        assert!(!is_excluded("lockfile.txt"));
    }

    #[tokio::test]
    async fn test_persist_restore_round_trip() {
        let data = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let target = tempdir().unwrap();

        write(&workspace.path().join("notes.txt"), "TOP");
        write(&workspace.path().join("src/deep/file.rs"), "fn main() {}");
        write(&workspace.path().join("node_modules/pkg/index.js"), "skip");
        write(&workspace.path().join("server.sock"), "skip");

        let store = SnapshotStore::new(data.path(), None);
        assert!(store.persist("ses_1", workspace.path(), "qa-bot").await);
        assert!(store.has("ses_1").await);

        let meta = store.metadata("ses_1").await.unwrap();
        assert_eq!(meta.session_id, "ses_1");
        assert_eq!(meta.agent_name, "qa-bot");

        assert!(store.restore("ses_1", target.path()).await);
        assert_eq!(
            std::fs::read_to_string(target.path().join("notes.txt")).unwrap(),
            "TOP"
        );
        assert!(target.path().join("src/deep/file.rs").exists());
        // Filtered names are present on neither side.
        assert!(!target.path().join("node_modules").exists());
        assert!(!target.path().join("server.sock").exists());
    }

    #[tokio::test]
    async fn test_restore_without_snapshot() {
        let data = tempdir().unwrap();
        let target = tempdir().unwrap();
        let store = SnapshotStore::new(data.path(), None);
        assert!(!store.restore("missing", target.path()).await);
        assert!(!store.has("missing").await);
    }

    #[tokio::test]
    async fn test_persist_replaces_previous() {
        let data = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let store = SnapshotStore::new(data.path(), None);

        write(&workspace.path().join("old.txt"), "old");
        assert!(store.persist("ses_1", workspace.path(), "bot").await);

        std::fs::remove_file(workspace.path().join("old.txt")).unwrap();
        write(&workspace.path().join("new.txt"), "new");
        assert!(store.persist("ses_1", workspace.path(), "bot").await);

        let target = tempdir().unwrap();
        assert!(store.restore("ses_1", target.path()).await);
        assert!(!target.path().join("old.txt").exists());
        assert!(target.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn test_delete() {
        let data = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        write(&workspace.path().join("f"), "x");

        let store = SnapshotStore::new(data.path(), None);
        assert!(store.persist("ses_1", workspace.path(), "bot").await);
        assert!(store.delete("ses_1").await);
        assert!(!store.has("ses_1").await);
    }
}
