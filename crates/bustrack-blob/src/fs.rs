//! Filesystem storage backend: objects written under a root directory.

use async_trait::async_trait;
use bustrack_core::{BusTrackError, Result};
use std::path::{Component, Path, PathBuf};

use crate::BlobStore;

pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    /// `public_base_url` empty ⇒ `file://` URLs pointing into `root`.
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(bucket).join(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(BusTrackError::Storage(format!("invalid object path {bucket}/{key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BusTrackError::Storage(format!("Create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| BusTrackError::Storage(format!("Write {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), content_type, size = bytes.len(), "📦 object written");
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        if self.public_base_url.is_empty() {
            format!("file://{}", self.root.join(bucket).join(key).display())
        } else {
            format!("{}/{}/{}", self.public_base_url, bucket, key)
        }
    }
}
