//! Workspace file access.
//!
//! Direct directory listing and file reads against a workspace (or
//! snapshot) root on disk, without a round-trip through the bridge. Paths
//! are always workspace-relative; traversal outside the root is rejected
//! before any filesystem call.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::snapshot::is_excluded;

/// Single-file read cap.
pub const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// File access failures.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    BadPath(String),

    #[error("path is a directory: {0}")]
    IsDirectory(String),

    #[error("file exceeds {MAX_FILE_BYTES} bytes: {0}")]
    TooLarge(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One workspace entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Workspace-relative path, `/`-separated.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Validate a caller-supplied relative path: no absolute paths, no `..`
/// segments, no empty input.
pub fn validate_rel_path(path: &str) -> Result<PathBuf, FileError> {
    if path.is_empty() {
        return Err(FileError::BadPath("empty path".to_string()));
    }
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(FileError::BadPath(format!("absolute path: {}", path)));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(FileError::BadPath(format!("traversal segment in: {}", path))),
        }
    }
    Ok(candidate.to_path_buf())
}

/// Recursive listing of a workspace root, applying the snapshot exclusion
/// rules so ephemeral and regeneratable entries never surface.
pub fn list_files(root: &Path) -> Result<Vec<FileEntry>, FileError> {
    if !root.exists() {
        return Err(FileError::NotFound(root.display().to_string()));
    }

    let mut entries = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
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
            .strip_prefix(root)
            .map_err(std::io::Error::other)?;
        let meta = entry.metadata().map_err(std::io::Error::other)?;
        entries.push(FileEntry {
            path: rel.to_string_lossy().replace('\\', "/"),
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
        });
    }

    Ok(entries)
}

/// Read one file under the root, capped at [`MAX_FILE_BYTES`].
pub fn read_file(root: &Path, rel_path: &str) -> Result<Vec<u8>, FileError> {
    let rel = validate_rel_path(rel_path)?;
    let full = root.join(&rel);

    let meta = std::fs::metadata(&full)
        .map_err(|_| FileError::NotFound(rel_path.to_string()))?;
    if meta.is_dir() {
        return Err(FileError::IsDirectory(rel_path.to_string()));
    }
    if meta.len() > MAX_FILE_BYTES {
        return Err(FileError::TooLarge(rel_path.to_string()));
    }

    Ok(std::fs::read(&full)?)
}

/// Write one file under the root, creating parent directories.
pub fn write_file(root: &Path, rel_path: &str, content: &[u8]) -> Result<(), FileError> {
    let rel = validate_rel_path(rel_path)?;
    let full = root.join(&rel);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&full, content)?;
    Ok(())
}

/// Delete one file under the root.
pub fn delete_file(root: &Path, rel_path: &str) -> Result<(), FileError> {
    let rel = validate_rel_path(rel_path)?;
    let full = root.join(&rel);
    let meta = std::fs::metadata(&full)
        .map_err(|_| FileError::NotFound(rel_path.to_string()))?;
    if meta.is_dir() {
        return Err(FileError::IsDirectory(rel_path.to_string()));
    }
    std::fs::remove_file(&full)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_path_validation() {
        assert!(validate_rel_path("src/main.rs").is_ok());
        assert!(validate_rel_path("./notes.txt").is_ok());
        assert!(validate_rel_path("").is_err());
        assert!(validate_rel_path("/etc/passwd").is_err());
        assert!(validate_rel_path("../outside").is_err());
        assert!(validate_rel_path("a/../../b").is_err());
    }

    #[test]
    fn test_list_and_read() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn x() {}").unwrap();
        std::fs::write(dir.path().join("bridge.sock"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();

        let entries = list_files(dir.path()).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"src"));
        assert!(paths.contains(&"src/lib.rs"));
        assert!(!paths.iter().any(|p| p.contains("node_modules")));
        assert!(!paths.contains(&"bridge.sock"));

        let content = read_file(dir.path(), "src/lib.rs").unwrap();
        assert_eq!(content, b"pub fn x() {}");
    }

    #[test]
    fn test_read_rejects_directory_and_missing() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();

        assert!(matches!(
            read_file(dir.path(), "sub"),
            Err(FileError::IsDirectory(_))
        ));
        assert!(matches!(
            read_file(dir.path(), "ghost.txt"),
            Err(FileError::NotFound(_))
        ));
    }

    #[test]
    fn test_read_size_cap() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("big.bin"),
            vec![0u8; (MAX_FILE_BYTES + 1) as usize],
        )
        .unwrap();
        assert!(matches!(
            read_file(dir.path(), "big.bin"),
            Err(FileError::TooLarge(_))
        ));
    }

    #[test]
    fn test_write_and_delete() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "notes/todo.md", b"- ship it").unwrap();
        assert_eq!(read_file(dir.path(), "notes/todo.md").unwrap(), b"- ship it");

        delete_file(dir.path(), "notes/todo.md").unwrap();
        assert!(matches!(
            read_file(dir.path(), "notes/todo.md"),
            Err(FileError::NotFound(_))
        ));
        assert!(matches!(
            delete_file(dir.path(), "notes"),
            Err(FileError::IsDirectory(_))
        ));
    }
}
