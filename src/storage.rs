//! Blob storage for raw uploads and annotated artifacts.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::PipelineError;

pub const RAW_DIR: &str = "raw";
pub const ANNOTATED_DIR: &str = "annotated";

/// Write-once byte storage addressed by relative paths such as `raw/<uuid>.png`.
pub trait BlobStore: Send + Sync {
    /// Persists `bytes` at `path`. Existing blobs are never overwritten.
    fn save(&self, path: &str, bytes: &[u8]) -> Result<(), PipelineError>;

    /// Deletes the blob at `path`.
    fn remove(&self, path: &str) -> Result<(), PipelineError>;

    /// Externally resolvable URL of `path`, given the base URL of the current request.
    fn base_url_for(&self, base_url: &str, path: &str) -> String;
}

/// Fresh `<uuid-v4>.<ext>` name.
pub fn unique_filename(extension: &str) -> String {
    format!("{}.{}", Uuid::new_v4(), extension)
}

pub fn blob_path(dir: &str, filename: &str) -> String {
    format!("{}/{}", dir, filename)
}

/// Blob store rooted at a local directory and published under `/<public_prefix>/`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_prefix: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_prefix: public_prefix.into(),
        }
    }
}

impl BlobStore for FsBlobStore {
    fn save(&self, path: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(|e| {
                PipelineError::Storage(format!("could not create {}: {}", target.display(), e))
            })?;
        file.write_all(bytes)?;
        file.sync_all()?;

        tracing::debug!(path = %target.display(), len = bytes.len(), "stored blob");
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), PipelineError> {
        let target = self.root.join(path);
        fs::remove_file(&target).map_err(|e| {
            PipelineError::Storage(format!("could not remove {}: {}", target.display(), e))
        })?;
        tracing::debug!(path = %target.display(), "removed blob");
        Ok(())
    }

    fn base_url_for(&self, base_url: &str, path: &str) -> String {
        format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.public_prefix.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
