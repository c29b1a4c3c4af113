//! Cancellation shared between the execution worker and a running program.
//!
//! The worker holds a [`CancellationToken`]; programs and capabilities that
//! wait on async work race it against [`CancellationToken::cancelled`].

use std::future::Future;
use tokio::runtime::Handle;
pub use tokio_util::sync::CancellationToken;

use crate::error::ScriptError;

/// Drive `fut` on `handle` from a blocking thread, abandoning it with
/// [`ScriptError::Cancelled`] as soon as `cancel` fires.
pub fn block_on_cancellable<T>(
    handle: &Handle,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, ScriptError>>,
) -> Result<T, ScriptError> {
    handle.block_on(async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScriptError::Cancelled),
            result = fut => result,
        }
    })
}
