//! BusTrack configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BusTrackError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusTrackConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

impl BusTrackConfig {
    /// Load config from the default path (~/.bustrack/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BusTrackError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content).map(Self::with_env_overrides)
    }

    /// Parse TOML text without touching the environment.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BusTrackError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| BusTrackError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Storage secrets may come from the environment instead of the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("SUPABASE_STORAGE_BASE_URL") {
            if !url.is_empty() {
                self.storage.base_url = url;
            }
        }
        if let Ok(key) = std::env::var("SUPABASE_SERVICE_KEY") {
            if !key.is_empty() {
                self.storage.service_key = key;
            }
        }
        self
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the BusTrack home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bustrack")
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Task Store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.bustrack/bustrack.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_path(&self.path)
    }
}

/// Timers and worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cron Manager tick.
    #[serde(default = "default_cron_interval")]
    pub cron_interval_secs: u64,
    /// Poller tick.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Concurrent execution workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Wall-clock budget for one script run.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// How long to wait for a cancelled run to unwind before abandoning it.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
    /// Attempts at persisting a terminal task record.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    /// Parallel uploads while materializing one result.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Close tasks stuck in `running` past timeout + grace, at start and on
    /// every cron tick. Tasks this process is still working on are skipped.
    #[serde(default = "bool_true", alias = "reap_orphans_on_start")]
    pub reap_orphans: bool,
}

fn default_cron_interval() -> u64 { 60 }
fn default_poll_interval() -> u64 { 1 }
fn default_workers() -> usize { 2 }
fn default_execution_timeout() -> u64 { 300 }
fn default_cancel_grace() -> u64 { 5 }
fn default_write_retries() -> u32 { 3 }
fn default_upload_concurrency() -> usize { 4 }
fn bool_true() -> bool { true }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cron_interval_secs: default_cron_interval(),
            poll_interval_secs: default_poll_interval(),
            workers: default_workers(),
            execution_timeout_secs: default_execution_timeout(),
            cancel_grace_secs: default_cancel_grace(),
            write_retries: default_write_retries(),
            upload_concurrency: default_upload_concurrency(),
            reap_orphans: true,
        }
    }
}

impl SchedulerConfig {
    pub fn cron_interval(&self) -> Duration {
        Duration::from_secs(self.cron_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs.max(1))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

/// Interpreter used by the subprocess sandbox engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Arguments for a syntax-only pass; empty disables the check.
    #[serde(default = "default_check_args")]
    pub check_args: Vec<String>,
    /// Extension of the scratch file the code is written to.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Pass the worker's PATH through to the script.
    #[serde(default = "bool_true")]
    pub inherit_path: bool,
}

fn default_command() -> String { "node".into() }
fn default_check_args() -> Vec<String> { vec!["--check".into()] }
fn default_extension() -> String { "js".into() }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            check_args: default_check_args(),
            extension: default_extension(),
            inherit_path: true,
        }
    }
}

/// Blob Store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "supabase", "filesystem", or "memory".
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Supabase storage endpoint, e.g. https://xyz.supabase.co/storage/v1
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub service_key: String,
    /// Bucket for assets that declare none.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Filesystem backend root.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
    /// Filesystem backend URL prefix; `file://` URLs when empty.
    #[serde(default)]
    pub public_base_url: String,
}

fn default_storage_backend() -> String { "supabase".into() }
fn default_bucket() -> String { crate::value::DEFAULT_BUCKET.into() }
fn default_storage_root() -> String { "~/.bustrack/blobs".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            base_url: String::new(),
            service_key: String::new(),
            bucket: default_bucket(),
            root_dir: default_storage_root(),
            public_base_url: String::new(),
        }
    }
}

/// Outbound HTTP used by the `get` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_user_agent() -> String { "BusTrack/0.1".into() }
fn default_http_timeout() -> u64 { 30 }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_http_timeout(),
        }
    }
}

/// Headless browser for the `browse`/`screenshot` capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Chrome/Chromium binary; auto-detected when unset.
    #[serde(default)]
    pub executable: Option<String>,
}
