//! Execute → materialize → write, for one claimed task.

use bustrack_core::ClaimedTask;
use std::sync::Arc;

use crate::executor::ExecutionWorker;
use crate::materialize::Materializer;
use crate::writer::ResultWriter;

#[derive(Clone)]
pub struct TaskPipeline {
    worker: ExecutionWorker,
    materializer: Materializer,
    writer: ResultWriter,
}

impl TaskPipeline {
    pub fn new(worker: ExecutionWorker, materializer: Materializer, writer: ResultWriter) -> Arc<Self> {
        Arc::new(Self {
            worker,
            materializer,
            writer,
        })
    }

    /// Drive a claimed task to `done`. Whatever happens upstream, the writer
    /// runs exactly once.
    pub async fn process(&self, task: ClaimedTask) {
        let started = std::time::Instant::now();

        let outcome = match self.worker.execute(&task).await {
            Ok(value) => self
                .materializer
                .materialize(value)
                .await
                .map_err(|e| e.to_string()),
            Err(message) => Err(message),
        };

        match &outcome {
            Ok(_) => tracing::info!(
                task_id = %task.task_id,
                function_id = %task.function_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "✅ Task finished"
            ),
            Err(message) => tracing::warn!(
                task_id = %task.task_id,
                function_id = %task.function_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "❌ Task failed: {message}"
            ),
        }

        if let Err(e) = self.writer.write(&task.task_id, outcome).await {
            tracing::error!(
                task_id = %task.task_id,
                "🚨 Could not persist task outcome, task stays running until reaped: {e}"
            );
        }
    }
}
