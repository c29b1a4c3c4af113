//! Supabase-compatible storage backend (HTTP object API).
//!
//! Upload:     POST {base}/object/{bucket}/{key}
//! Public URL: {base}/object/public/{bucket}/{key}

use async_trait::async_trait;
use bustrack_core::{BusTrackError, Result};
use reqwest::Url;
use std::time::Duration;

use crate::BlobStore;

/// Storage client holding the service key.
pub struct SupabaseStorage {
    base_url: Url,
    service_key: String,
    client: reqwest::Client,
}

impl SupabaseStorage {
    /// `base_url` is the storage endpoint, e.g. `https://xyz.supabase.co/storage/v1`.
    pub fn new(base_url: &str, service_key: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(BusTrackError::Config(
                "storage.base_url (or SUPABASE_STORAGE_BASE_URL) is not set".into(),
            ));
        }
        let base_url = Url::parse(base_url)
            .map_err(|e| BusTrackError::Config(format!("storage.base_url '{base_url}' is invalid: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BusTrackError::Config(format!(
                "storage.base_url '{base_url}' cannot carry object paths"
            )));
        }
        if service_key.is_empty() {
            tracing::warn!("⚠️ Supabase service key is empty, uploads will likely be rejected");
        }
        let client = reqwest::Client::builder()
            .user_agent("BusTrack/0.1")
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BusTrackError::Storage(format!("Client error: {e}")))?;
        Ok(Self {
            base_url,
            service_key: service_key.to_string(),
            client,
        })
    }

    /// `{base}/object/{prefix..}/{bucket}/{key}`. Bucket and key are pushed as
    /// single segments, so `/` and `..` inside them are escaped rather than
    /// walked.
    fn object_url(&self, prefix: &[&str], bucket: &str, key: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("object")
                .extend(prefix)
                .push(bucket)
                .push(key.trim_start_matches('/'));
        }
        url
    }
}

#[async_trait]
impl BlobStore for SupabaseStorage {
    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let size = bytes.len();
        let resp = self
            .client
            .post(self.object_url(&[], bucket, key))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CACHE_CONTROL, "max-age=3600")
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|e| BusTrackError::Storage(format!("Upload {bucket}/{key} failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!(bucket, key, size, "📦 object uploaded");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            Err(BusTrackError::Storage(format!(
                "Upload {bucket}/{key} rejected ({status}): {message}"
            )))
        }
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        self.object_url(&["public"], bucket, key).into()
    }
}
