//! Error taxonomy shared by every BusTrack crate.

/// Errors raised anywhere in the scheduling and execution pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BusTrackError {
    #[error("config error: {0}")]
    Config(String),

    /// Task Store failure (claim, insert, update, read).
    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-set write lost to a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Blob Store failure (upload or URL resolution).
    #[error("storage error: {0}")]
    Storage(String),

    /// Compile or runtime failure of a user script, including capability failures.
    #[error("script error: {0}")]
    Script(String),

    /// Malformed or never-firing cron expression.
    #[error("cron error: {0}")]
    Cron(String),

    #[error("materialize error: {0}")]
    Materialize(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, BusTrackError>;
