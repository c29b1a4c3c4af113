//! # BusTrack Blob
//!
//! Object storage for binary assets found in task results. The pipeline
//! depends only on [`BlobStore`]; backends are picked from configuration.
//!
//! ```text
//! BlobStore
//!   ├── SupabaseStorage  HTTP object API (production)
//!   ├── FsBlobStore     : local directory (single host)
//!   └── MemoryBlobStore  in-process map (dry runs, tests)
//! ```

pub mod fs;
pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use bustrack_core::config::StorageConfig;
use bustrack_core::{BusTrackError, Result};
use std::sync::Arc;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use supabase::SupabaseStorage;

/// Durable object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `bucket/key` with the given content type.
    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Public URL of an object; pure, does not check existence.
    fn public_url(&self, bucket: &str, key: &str) -> String;
}

/// Build the configured backend.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    match config.backend.as_str() {
        "supabase" => Ok(Arc::new(SupabaseStorage::new(&config.base_url, &config.service_key)?)),
        "filesystem" | "fs" => Ok(Arc::new(FsBlobStore::new(
            bustrack_core::config::expand_path(&config.root_dir),
            &config.public_base_url,
        ))),
        "memory" => Ok(Arc::new(MemoryBlobStore::new())),
        other => Err(BusTrackError::Config(format!(
            "unknown storage backend '{other}' (expected supabase, filesystem, or memory)"
        ))),
    }
}
