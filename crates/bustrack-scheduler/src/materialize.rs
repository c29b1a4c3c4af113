//! Result Materializer: uploads embedded assets and swaps in references.
//!
//! Walks the result tree, uploads every asset node exactly once (no content
//! deduplication), and replaces each with
//! `{"type": "image", "url": <public url>, "original_url": <origin>}`.
//! `original_url` is omitted when the asset has no origin. The first failed
//! upload aborts the whole walk; no partially rewritten tree is returned.
//!
//! Bucket names come from script output and must match `[A-Za-z0-9_-]+`.
//! A tree with any other bucket is rejected before the first upload.

use bustrack_blob::BlobStore;
use bustrack_core::{Asset, BusTrackError, Result, Value};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Materializer {
    blobs: Arc<dyn BlobStore>,
    default_bucket: String,
    concurrency: usize,
}

impl Materializer {
    /// `concurrency` bounds in-flight uploads for one result tree.
    pub fn new(blobs: Arc<dyn BlobStore>, default_bucket: &str, concurrency: usize) -> Self {
        Self {
            blobs,
            default_bucket: default_bucket.to_string(),
            concurrency: concurrency.max(1),
        }
    }

    pub async fn materialize(&self, mut value: Value) -> Result<Value> {
        if value.asset_count() == 0 {
            return Ok(value);
        }

        let mut slots = Vec::new();
        collect_asset_slots(&mut value, &mut slots);

        let mut pending = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Value::Asset(asset) = std::mem::replace(&mut *slot, Value::Null) {
                pending.push((slot, asset));
            }
        }
        let (slots, assets): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        for asset in &assets {
            check_bucket(self.bucket_for(asset))?;
        }

        // `buffered` keeps results in tree order; `try_collect` stops at the first error.
        let references: Vec<Value> = stream::iter(assets.into_iter().map(|asset| self.upload(asset)))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        for (slot, reference) in slots.into_iter().zip(references) {
            *slot = reference;
        }
        Ok(value)
    }

    fn bucket_for<'a>(&'a self, asset: &'a Asset) -> &'a str {
        asset.bucket.as_deref().unwrap_or(&self.default_bucket)
    }

    async fn upload(&self, asset: Asset) -> Result<Value> {
        let bucket = self.bucket_for(&asset).to_string();
        let key = object_key(&asset);
        let Asset {
            bytes,
            content_type,
            name,
            origin_url,
            ..
        } = asset;
        let size = bytes.len();

        self.blobs
            .upload(&bucket, &key, bytes, &content_type)
            .await
            .map_err(|e| BusTrackError::Materialize(format!("uploading '{name}' failed: {e}")))?;

        let url = self.blobs.public_url(&bucket, &key);
        tracing::debug!(bucket = %bucket, key = %key, size, "🖼️ asset materialized");
        Ok(image_reference(url, origin_url))
    }
}

fn collect_asset_slots<'a>(value: &'a mut Value, out: &mut Vec<&'a mut Value>) {
    if matches!(value, Value::Asset(_)) {
        out.push(value);
        return;
    }
    match value {
        Value::List(items) => {
            for item in items {
                collect_asset_slots(item, out);
            }
        }
        Value::Map(entries) => {
            for item in entries.values_mut() {
                collect_asset_slots(item, out);
            }
        }
        _ => {}
    }
}

fn check_bucket(bucket: &str) -> Result<()> {
    let valid = !bucket.is_empty()
        && bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(BusTrackError::Materialize(format!("invalid bucket name '{bucket}'")))
    }
}

/// Fresh unique key: uuid v4 plus the asset's extension when it has one.
fn object_key(asset: &Asset) -> String {
    let id = uuid::Uuid::new_v4();
    let ext = asset.extension().map(str::to_ascii_lowercase).or_else(|| {
        asset
            .content_type
            .split(';')
            .next()
            .and_then(|mime| mime.trim().strip_prefix("image/"))
            .filter(|sub| !sub.is_empty() && sub.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(str::to_ascii_lowercase)
    });
    match ext {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    }
}

fn image_reference(url: String, origin_url: Option<String>) -> Value {
    let mut map = BTreeMap::new();
    map.insert("type".to_string(), Value::from("image"));
    map.insert("url".to_string(), Value::String(url));
    if let Some(origin) = origin_url {
        map.insert("original_url".to_string(), Value::String(origin));
    }
    Value::Map(map)
}
