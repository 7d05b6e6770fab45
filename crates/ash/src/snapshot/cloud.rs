//! Cloud snapshot mirror.
//!
//! Mirrors local snapshots as tar.gz archives into an object store reached
//! over plain HTTPS. `s3://bucket[/prefix]` and `gs://bucket[/prefix]` URLs
//! map to the providers' public object endpoints; `http(s)://` URLs are used
//! verbatim. Authentication is an optional pass-through `Authorization`
//! header, which covers presigned gateways and S3-compatible dev stores.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Mirror configuration failures.
#[derive(Debug, Error)]
pub enum CloudUrlError {
    #[error("unsupported snapshot URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("snapshot URL has no bucket: {0}")]
    MissingBucket(String),
}

/// Object-store mirror for snapshot archives.
#[derive(Debug, Clone)]
pub struct CloudMirror {
    /// Base HTTPS endpoint, no trailing slash.
    endpoint: String,
    auth_header: Option<String>,
    client: reqwest::Client,
}

impl CloudMirror {
    /// Build a mirror from an `ASH_SNAPSHOT_URL` value.
    pub fn from_url(url: &str, auth_header: Option<String>) -> Result<Self, CloudUrlError> {
        let endpoint = resolve_endpoint(url)?;
        Ok(Self {
            endpoint,
            auth_header,
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        })
    }

    fn object_url(&self, session_id: &str) -> String {
        format!("{}/{}.tar.gz", self.endpoint, session_id)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_header {
            Some(auth) => builder.header("Authorization", auth),
            None => builder,
        }
    }

    /// Pack `snapshot_dir` into `archive_path` and upload it. Best-effort.
    pub async fn upload(
        &self,
        session_id: &str,
        snapshot_dir: &Path,
        archive_path: &Path,
    ) -> bool {
        let src = snapshot_dir.to_path_buf();
        let archive = archive_path.to_path_buf();
        let packed = tokio::task::spawn_blocking(move || pack_tar_gz(&src, &archive)).await;
        match packed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Snapshot archive pack failed for {}: {:?}", session_id, e);
                return false;
            }
            Err(e) => {
                warn!("Snapshot archive task panicked for {}: {:?}", session_id, e);
                return false;
            }
        }

        let bytes = match tokio::fs::read(archive_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Snapshot archive read failed for {}: {:?}", session_id, e);
                return false;
            }
        };

        let url = self.object_url(session_id);
        debug!("Uploading snapshot archive for {} ({} bytes)", session_id, bytes.len());
        match self
            .request(self.client.put(&url))
            .header("Content-Type", "application/gzip")
            .body(bytes)
            .send()
            .await
        {
            Ok(res) if res.status().is_success() => true,
            Ok(res) => {
                warn!("Snapshot upload for {} returned {}", session_id, res.status());
                false
            }
            Err(e) => {
                warn!("Snapshot upload for {} failed: {:?}", session_id, e);
                false
            }
        }
    }

    /// Download the archive and unpack it into `snapshot_dir`. Returns
    /// `false` when the object does not exist or anything fails.
    pub async fn download(
        &self,
        session_id: &str,
        archive_path: &Path,
        snapshot_dir: &Path,
    ) -> bool {
        let url = self.object_url(session_id);
        let response = match self.request(self.client.get(&url)).send().await {
            Ok(res) if res.status().is_success() => res,
            Ok(res) => {
                debug!("Cloud snapshot for {} not available: {}", session_id, res.status());
                return false;
            }
            Err(e) => {
                warn!("Snapshot download for {} failed: {:?}", session_id, e);
                return false;
            }
        };

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Snapshot download body for {} failed: {:?}", session_id, e);
                return false;
            }
        };
        if let Err(e) = tokio::fs::write(archive_path, &bytes).await {
            warn!("Snapshot archive write failed for {}: {:?}", session_id, e);
            return false;
        }

        let archive = archive_path.to_path_buf();
        let dest = snapshot_dir.to_path_buf();
        match tokio::task::spawn_blocking(move || unpack_tar_gz(&archive, &dest)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Snapshot unpack failed for {}: {:?}", session_id, e);
                false
            }
            Err(e) => {
                warn!("Snapshot unpack task panicked for {}: {:?}", session_id, e);
                false
            }
        }
    }

    /// Delete the mirrored archive. Best-effort; missing objects count as
    /// deleted.
    pub async fn delete(&self, session_id: &str) -> bool {
        let url = self.object_url(session_id);
        match self.request(self.client.delete(&url)).send().await {
            Ok(res) if res.status().is_success() || res.status().as_u16() == 404 => true,
            Ok(res) => {
                warn!("Snapshot delete for {} returned {}", session_id, res.status());
                false
            }
            Err(e) => {
                warn!("Snapshot delete for {} failed: {:?}", session_id, e);
                false
            }
        }
    }
}

/// Map a snapshot URL to its HTTPS object endpoint.
fn resolve_endpoint(url: &str) -> Result<String, CloudUrlError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| CloudUrlError::UnsupportedScheme(url.to_string()))?;
    let rest = rest.trim_end_matches('/');

    match scheme {
        "http" | "https" => Ok(format!("{}://{}", scheme, rest)),
        "s3" => {
            let (bucket, prefix) = split_bucket(rest, url)?;
            Ok(match prefix {
                Some(prefix) => format!("https://{}.s3.amazonaws.com/{}", bucket, prefix),
                None => format!("https://{}.s3.amazonaws.com", bucket),
            })
        }
        "gs" => {
            let (bucket, prefix) = split_bucket(rest, url)?;
            Ok(match prefix {
                Some(prefix) => format!("https://storage.googleapis.com/{}/{}", bucket, prefix),
                None => format!("https://storage.googleapis.com/{}", bucket),
            })
        }
        other => Err(CloudUrlError::UnsupportedScheme(other.to_string())),
    }
}

fn split_bucket<'a>(rest: &'a str, url: &str) -> Result<(&'a str, Option<&'a str>), CloudUrlError> {
    match rest.split_once('/') {
        Some((bucket, prefix)) if !bucket.is_empty() => {
            Ok((bucket, (!prefix.is_empty()).then_some(prefix)))
        }
        None if !rest.is_empty() => Ok((rest, None)),
        _ => Err(CloudUrlError::MissingBucket(url.to_string())),
    }
}

fn pack_tar_gz(src: &Path, archive: &Path) -> std::io::Result<()> {
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(archive)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", src)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

fn unpack_tar_gz(archive: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive)?;
    let decoder = GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_endpoint_schemes() {
        assert_eq!(
            resolve_endpoint("s3://ash-snaps").unwrap(),
            "https://ash-snaps.s3.amazonaws.com"
        );
        assert_eq!(
            resolve_endpoint("s3://ash-snaps/prod").unwrap(),
            "https://ash-snaps.s3.amazonaws.com/prod"
        );
        assert_eq!(
            resolve_endpoint("gs://ash-snaps/a/b/").unwrap(),
            "https://storage.googleapis.com/ash-snaps/a/b"
        );
        assert_eq!(
            resolve_endpoint("https://minio.local:9000/snaps").unwrap(),
            "https://minio.local:9000/snaps"
        );
        assert!(resolve_endpoint("ftp://nope").is_err());
        assert!(resolve_endpoint("s3://").is_err());
        assert!(resolve_endpoint("plainstring").is_err());
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let src = tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(src.path().join("sub/b.txt"), "beta").unwrap();

        let work = tempdir().unwrap();
        let archive = work.path().join("snap.tar.gz");
        pack_tar_gz(src.path(), &archive).unwrap();
        assert!(archive.exists());

        let dest = tempdir().unwrap();
        unpack_tar_gz(&archive, dest.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.path().join("a.txt")).unwrap(),
            "alpha"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("sub/b.txt")).unwrap(),
            "beta"
        );
    }
}
