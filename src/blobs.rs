//! Content-addressed blob storage on the local filesystem.
//!
//! Every blob lives at `<root>/<sha256 hex>`. Writes of the same hash always
//! carry the same bytes, so concurrent writers need no locking; each write
//! goes through a uniquely named temp file and a rename so readers never
//! observe a partial blob.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use tokio::fs;
use tracing::{debug, warn};

use product_hub_core::hash::is_content_hash;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Removes a half-written temp file when a write fails or its future is
/// dropped before the rename.
struct TempFile(Option<PathBuf>);

impl TempFile {
    fn keep(mut self) {
        self.0 = None;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove temp blob");
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob for `hash`. Rejects anything but a sha256 hex digest.
    pub fn path(&self, hash: &str) -> Result<PathBuf> {
        if !is_content_hash(hash) {
            bail!("not a content hash: {:?}", hash);
        }
        Ok(self.root.join(hash))
    }

    /// Store `data` under `hash`, creating the root directory on demand.
    pub async fn write(&self, hash: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.path(hash)?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;

        let tmp = self.root.join(format!(
            ".{}.{}-{}.tmp",
            hash,
            std::process::id(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let guard = TempFile(Some(tmp.clone()));
        fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move blob into {}", path.display()))?;
        guard.keep();

        debug!(hash = %hash, bytes = data.len(), "blob stored");
        Ok(path)
    }

    /// Read the blob for `hash`; `Ok(None)` when it is not stored.
    pub async fn read(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(hash)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path(hash)?).await?)
    }
}
