//! `get(url)`: HTTP GET, decoded by content type.

use bustrack_core::config::HttpConfig;
use bustrack_core::{Asset, Value};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::cancel::{CancellationToken, block_on_cancellable};
use crate::capability::{Capability, string_arg};
use crate::error::ScriptError;

const NAME: &str = "get";

static CONTENT_DISPOSITION: OnceLock<Option<Regex>> = OnceLock::new();

pub struct GetCapability {
    client: reqwest::Client,
    handle: Handle,
}

impl GetCapability {
    /// `handle` must belong to a runtime that outlives every call.
    pub fn new(config: &HttpConfig, handle: Handle) -> Result<Self, ScriptError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ScriptError::capability(NAME, format!("client error: {e}")))?;
        Ok(Self { client, handle })
    }

    async fn fetch(&self, url: &str) -> Result<Value, ScriptError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScriptError::capability(NAME, format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScriptError::capability(NAME, format!("{url} returned {status}")));
        }
        let header = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE).unwrap_or_default();
        let disposition = header(reqwest::header::CONTENT_DISPOSITION);
        let body = resp
            .bytes()
            .await
            .map_err(|e| ScriptError::capability(NAME, format!("reading body of {url}: {e}")))?;

        decode_body(url, &content_type, disposition.as_deref(), body.to_vec())
    }
}

impl Capability for GetCapability {
    fn name(&self) -> &str {
        NAME
    }

    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn call(&self, args: Vec<Value>, cancel: &CancellationToken) -> Result<Value, ScriptError> {
        let url = string_arg(NAME, &args, 0)?;
        block_on_cancellable(&self.handle, cancel, self.fetch(&url))
    }
}

/// Turn a response body into a script value according to its content type.
pub fn decode_body(
    url: &str,
    content_type: &str,
    content_disposition: Option<&str>,
    body: Vec<u8>,
) -> Result<Value, ScriptError> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime == "application/json" || mime.ends_with("+json") {
        let json: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| ScriptError::capability(NAME, format!("invalid JSON from {url}: {e}")))?;
        return Ok(Value::from(json));
    }
    if mime.starts_with("text/") {
        return Ok(Value::String(String::from_utf8_lossy(&body).into_owned()));
    }
    if mime.starts_with("image/") {
        let name = content_disposition
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| last_segment(url));
        return Ok(Value::Asset(Asset::new(body, mime, name).with_origin(url)));
    }
    Err(ScriptError::capability(
        NAME,
        format!("Content-Type {content_type} is not supported"),
    ))
}

fn filename_from_disposition(header: &str) -> Option<String> {
    let re = CONTENT_DISPOSITION
        .get_or_init(|| Regex::new(r#"filename(?:\*=UTF-8''|=)"?([^";]+)"?"#).ok())
        .as_ref()?;
    let name = re.captures(header)?.get(1)?.as_str().trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn last_segment(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}
