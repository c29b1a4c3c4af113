//! Execution Worker: runs a claimed task's function inside a Sandbox.
//!
//! Every failure (missing function, compile error, runtime error, timeout,
//! engine panic) comes back as an error message for the task record, never
//! as a fault of the worker itself.

use bustrack_core::{ClaimedTask, Function, Value};
use bustrack_sandbox::{CapabilityTable, Sandbox, ScriptEngine, ScriptError};
use bustrack_store::TaskStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::Instant;

#[derive(Clone)]
pub struct ExecutionWorker {
    store: Arc<dyn TaskStore>,
    engine: Arc<dyn ScriptEngine>,
    capabilities: CapabilityTable,
    timeout: Duration,
    cancel_grace: Duration,
}

impl ExecutionWorker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        engine: Arc<dyn ScriptEngine>,
        capabilities: CapabilityTable,
        timeout: Duration,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            capabilities,
            timeout,
            cancel_grace,
        }
    }

    /// Load, compile, and run the task's function within the wall-clock budget.
    pub async fn execute(&self, task: &ClaimedTask) -> Result<Value, String> {
        let deadline = Instant::now() + self.timeout;
        let function = self.load_function(&task.function_id).await?;
        tracing::debug!(
            task_id = %task.task_id,
            function_id = %function.id,
            engine = self.engine.name(),
            env = function.env.len(),
            "🚀 Executing function"
        );

        let engine = self.engine.clone();
        let capabilities = self.capabilities.clone();
        let compile = tokio::task::spawn_blocking(move || {
            Sandbox::new(engine.as_ref(), &function.code, function.env, capabilities)
        });
        let sandbox = match tokio::time::timeout_at(deadline, compile).await {
            Ok(joined) => joined.map_err(panic_message)?.map_err(|e| e.to_string())?,
            Err(_) => return Err(self.timeout_message()),
        };

        let cancel = sandbox.cancel_token();
        let mut run = tokio::task::spawn_blocking(move || sandbox.run());
        match tokio::time::timeout_at(deadline, &mut run).await {
            Ok(joined) => joined.map_err(panic_message)?.map_err(|e| e.to_string()),
            Err(_) => {
                cancel.cancel();
                if tokio::time::timeout(self.cancel_grace, &mut run).await.is_err() {
                    tracing::warn!(
                        task_id = %task.task_id,
                        grace_secs = self.cancel_grace.as_secs(),
                        "⚠️ Sandbox ignored cancellation, abandoning its thread"
                    );
                }
                Err(self.timeout_message())
            }
        }
    }

    async fn load_function(&self, function_id: &str) -> Result<Function, String> {
        let store = self.store.clone();
        let id = function_id.to_string();
        tokio::task::spawn_blocking(move || store.get_function(&id))
            .await
            .map_err(panic_message)?
            .map_err(|e| e.to_string())
    }

    fn timeout_message(&self) -> String {
        ScriptError::Timeout(self.timeout.as_secs()).to_string()
    }
}

fn panic_message(e: JoinError) -> String {
    if !e.is_panic() {
        return format!("script engine was cancelled: {e}");
    }
    let payload = e.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "no message".to_string());
    format!("script engine panicked: {detail}")
}
