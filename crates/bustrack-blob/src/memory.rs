//! In-memory storage backend.

use async_trait::async_trait;
use bustrack_core::Result;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::BlobStore;

/// A stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Keeps every upload in a map keyed by `bucket/key`.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .ok()
            .and_then(|m| m.get(&format!("{bucket}/{key}")).cloned())
    }

    /// Every stored `bucket/key`, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|e| bustrack_core::BusTrackError::Storage(format!("Lock: {e}")))?;
        objects.insert(
            format!("{bucket}/{key}"),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{bucket}/{key}")
    }
}
