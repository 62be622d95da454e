use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, content-addressed archive of raw listing pages so filter and
/// score decisions can be replayed against exactly what was fetched.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        strategy: &str,
        offset: usize,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(strategy)
            .join(format!("{offset:06}-{content_hash}.json"))
    }

    /// Write via temp file + rename; an identical page already on disk is
    /// reported as deduplicated.
    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        strategy: &str,
        offset: usize,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, strategy, offset, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let existed = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        let deduplicated = existed || !write_new_file(&parent, &absolute_path, bytes).await?;

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Returns false when another writer renamed the same content in first.
async fn write_new_file(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), target.display())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_hashing_is_stable() {
        let hash = PageArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_pages_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-03-02T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let body = br#"{"totalRecords":0,"opportunitiesData":[]}"#;

        let first = archive
            .archive_page(fetched_at, "naics_targeted", 0, body)
            .await
            .expect("first archive");
        let second = archive
            .archive_page(fetched_at, "naics_targeted", 0, body)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first
            .relative_path
            .to_string_lossy()
            .starts_with("20260302/naics_targeted/000000-"));
    }
}
