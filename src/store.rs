//! Artifact persistence
//!
//! The scheduler hands finished image bytes to an [`ArtifactStore`] under the
//! job's name. Stores must tolerate being called again for the same name: a
//! later retry replaces whatever an earlier attempt left behind.

use crate::{sanitize_filename, OutputFormat};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tracing::debug;

/// Where a stored artifact can be found
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArtifactRef {
    pub name: String,
    /// Store-specific location, a file path for [`FsArtifactStore`]
    pub location: String,
    pub size: usize,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` under `name`, replacing any previous artifact with
    /// that name.
    async fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<ArtifactRef>;
}

/// Writes each artifact to `<dir>/<name>.<ext>`
///
/// Files are written to a temporary sibling first and renamed into place, so
/// readers never observe a half-written capture and retries overwrite
/// atomically.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
    format: OutputFormat,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File an artifact named `name` is written to. Distinct names always
    /// get distinct paths.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let stem = sanitize_filename(name);
        self.dir.join(format!("{stem}.{}", self.format.extension()))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<ArtifactRef> {
        anyhow::ensure!(!name.is_empty(), "artifact name must not be empty");

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let path = self.path_for(name);
        let tmp = path.with_extension(format!("{}.partial", self.format.extension()));

        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("moving capture into {}", path.display()))?;

        debug!(name, path = %path.display(), size = bytes.len(), "Stored artifact");

        Ok(ArtifactRef {
            name: name.to_string(),
            location: path.display().to_string(),
            size: bytes.len(),
        })
    }
}

/// Keeps artifacts in memory; used for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<ArtifactRef> {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), bytes.to_vec());

        Ok(ArtifactRef {
            name: name.to_string(),
            location: format!("memory://{name}"),
            size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_fs_store_writes_named_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path().join("captures"), OutputFormat::Png);

        let artifact = assert_ok!(store.store("ebdk", b"\x89PNG").await);

        let expected = dir.path().join("captures").join("ebdk.png");
        assert_eq!(artifact.location, expected.display().to_string());
        assert_eq!(artifact.size, 4);
        assert_eq!(std::fs::read(&expected).expect("file exists"), b"\x89PNG");
    }

    #[tokio::test]
    async fn test_fs_store_overwrites_same_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path(), OutputFormat::Jpeg);

        assert_ok!(store.store("btdk", b"first attempt").await);
        let artifact = assert_ok!(store.store("btdk", b"retry").await);

        assert_eq!(std::fs::read(&artifact.location).expect("file exists"), b"retry");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_fs_store_escapes_names() {
        let store = FsArtifactStore::new("/tmp/out", OutputFormat::Webp);
        assert_eq!(store.path_for("a/b"), PathBuf::from("/tmp/out/a%2Fb.webp"));
        assert_eq!(store.path_for(".."), PathBuf::from("/tmp/out/%2E..webp"));
    }

    #[tokio::test]
    async fn test_fs_store_keeps_similar_names_apart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path(), OutputFormat::Png);

        let slashed = assert_ok!(store.store("a/b", b"slashed").await);
        let underscored = assert_ok!(store.store("a_b", b"underscored").await);
        let hidden = assert_ok!(store.store(".x", b"hidden").await);
        let plain = assert_ok!(store.store("x", b"plain").await);

        assert_ne!(slashed.location, underscored.location);
        assert_ne!(hidden.location, plain.location);
        assert_eq!(std::fs::read(&slashed.location).expect("file exists"), b"slashed");
        assert_eq!(std::fs::read(&underscored.location).expect("file exists"), b"underscored");
        assert_eq!(std::fs::read(&hidden.location).expect("file exists"), b"hidden");
        assert_eq!(std::fs::read(&plain.location).expect("file exists"), b"plain");
    }

    #[tokio::test]
    async fn test_fs_store_rejects_empty_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path(), OutputFormat::Png);
        assert!(store.store("", b"bytes").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryArtifactStore::new();
        assert!(store.is_empty());

        let artifact = assert_ok!(store.store("ex1", &[1, 2, 3]).await);
        assert_eq!(artifact.location, "memory://ex1");
        assert_eq!(store.get("ex1"), Some(vec![1, 2, 3]));
        assert_eq!(store.len(), 1);
    }
}
