//! Script-level failures.

use thiserror::Error;

/// Everything a compile or run can fail with.
///
/// None of these escape the execution worker; they become the task's error text.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("undefined name '{0}'")]
    UnresolvedReference(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("{name}(): {message}")]
    Capability { name: String, message: String },

    #[error("script timed out after {0}s")]
    Timeout(u64),

    #[error("script cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    pub fn capability(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capability {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<ScriptError> for bustrack_core::BusTrackError {
    fn from(e: ScriptError) -> Self {
        bustrack_core::BusTrackError::Script(e.to_string())
    }
}
