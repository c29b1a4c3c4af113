//! Dynamic result value: the tagged tree a sandbox run produces.
//!
//! Scalars, ordered lists, keyed maps, and opaque binary assets. Maps are
//! kept in a `BTreeMap` so the canonical JSON rendering is deterministic.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BusTrackError, Result};

/// Bucket used when an asset does not declare one.
pub const DEFAULT_BUCKET: &str = "images";

/// Largest integer an `f64` represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A node of the result tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Asset(Asset),
}

/// Raw binary payload destined for blob storage.
#[derive(Clone, PartialEq)]
pub struct Asset {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Suggested file name, e.g. `screenshot.png`.
    pub name: String,
    /// Where the payload was fetched from, if anywhere.
    pub origin_url: Option<String>,
    /// Target bucket; [`DEFAULT_BUCKET`] when absent.
    pub bucket: Option<String>,
}

impl Asset {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
            name: name.into(),
            origin_url: None,
            bucket: None,
        }
    }

    pub fn with_origin(mut self, url: impl Into<String>) -> Self {
        self.origin_url = Some(url.into());
        self
    }

    pub fn bucket(&self) -> &str {
        self.bucket.as_deref().unwrap_or(DEFAULT_BUCKET)
    }

    /// Extension of the suggested name (without the dot), if it has a usable one.
    pub fn extension(&self) -> Option<&str> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() || ext.len() > 8 {
            return None;
        }
        ext.chars().all(|c| c.is_ascii_alphanumeric()).then_some(ext)
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .field("content_type", &self.content_type)
            .field("name", &self.name)
            .field("origin_url", &self.origin_url)
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Asset(_) => "asset",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Number of asset nodes anywhere in the tree.
    pub fn asset_count(&self) -> usize {
        match self {
            Value::Asset(_) => 1,
            Value::List(items) => items.iter().map(Value::asset_count).sum(),
            Value::Map(entries) => entries.values().map(Value::asset_count).sum(),
            _ => 0,
        }
    }

    /// Canonical JSON form. Fails on assets (they must be materialized first)
    /// and on non-finite numbers.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n)?,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Result<Vec<_>>>()?,
            ),
            Value::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(map)
            }
            Value::Asset(asset) => {
                return Err(BusTrackError::Serialize(format!(
                    "asset '{}' was not materialized",
                    asset.name
                )));
            }
        })
    }

    /// Compact canonical JSON text.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json()?)?)
    }
}

fn number_to_json(n: f64) -> Result<serde_json::Value> {
    if !n.is_finite() {
        return Err(BusTrackError::Serialize(format!("non-finite number {n}")));
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Ok(serde_json::Value::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .ok_or_else(|| BusTrackError::Serialize(format!("unrepresentable number {n}")))
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Asset> for Value {
    fn from(asset: Asset) -> Self {
        Value::Asset(asset)
    }
}

impl<V: Into<Value>> FromIterator<(String, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Value::Map(iter.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}
