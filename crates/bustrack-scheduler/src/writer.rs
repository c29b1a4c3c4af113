//! Result Writer: the single path that moves a running task to `done`.

use bustrack_core::{BusTrackError, Result, Value};
use bustrack_store::TaskStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// A task's outcome before rendering: the final value or a failure message.
pub type Outcome = std::result::Result<Value, String>;

/// Error text recorded when a failure carries no message.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// `(result, error)` as stored. Exactly one side is non-empty.
pub fn render(outcome: Outcome) -> (String, String) {
    match outcome {
        Ok(Value::String(s)) => (s, String::new()),
        Ok(value) => match value.to_json_string() {
            Ok(json) => (json, String::new()),
            Err(e) => (String::new(), e.to_string()),
        },
        Err(message) if message.trim().is_empty() => (String::new(), UNKNOWN_ERROR.to_string()),
        Err(message) => (String::new(), message),
    }
}

#[derive(Clone)]
pub struct ResultWriter {
    store: Arc<dyn TaskStore>,
    retries: u32,
    retry_delay: Duration,
}

impl ResultWriter {
    pub fn new(store: Arc<dyn TaskStore>, retries: u32) -> Self {
        Self {
            store,
            retries,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Persist the terminal record. Store failures are retried `retries`
    /// times with a doubling delay; a task that is no longer running is not.
    pub async fn write(&self, task_id: &str, outcome: Outcome) -> Result<()> {
        let (result, error) = render(outcome);
        let mut delay = self.retry_delay;
        let mut attempt = 0;

        loop {
            let store = self.store.clone();
            let (id, res, err) = (task_id.to_string(), result.clone(), error.clone());
            let written = tokio::task::spawn_blocking(move || store.write_result(&id, &res, &err, Utc::now()))
                .await
                .map_err(|e| BusTrackError::Store(format!("write_result panicked: {e}")))
                .and_then(|r| r);

            match written {
                Ok(()) => {
                    tracing::debug!(task_id = %task_id, failed = !error.is_empty(), "💾 Result written");
                    return Ok(());
                }
                Err(e) if attempt < self.retries && is_transient(&e) => {
                    attempt += 1;
                    tracing::warn!(
                        task_id = %task_id,
                        attempt,
                        "⚠️ Result write failed, retrying in {}ms: {e}",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(e: &BusTrackError) -> bool {
    match e {
        BusTrackError::Store(message) => !message.ends_with("is not running"),
        BusTrackError::Io(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bustrack_core::{Asset, ClaimedTask, Crontab, Function, TaskStatus};
    use bustrack_store::{SqliteTaskStore, TaskId};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn running_task(store: &SqliteTaskStore) -> String {
        store
            .upsert_function(&Function {
                id: "fn-1".into(),
                code: String::new(),
                env: Default::default(),
            })
            .unwrap();
        store.insert_pending_task("fn-1", None).unwrap();
        store.claim_next_pending_task(Utc::now()).unwrap().unwrap().task_id
    }

    #[test]
    fn test_render_outcomes() {
        assert_eq!(render(Ok(Value::from("plain text"))), ("plain text".into(), String::new()));

        let map: Value = vec![("title".to_string(), Value::from("x"))].into_iter().collect();
        assert_eq!(render(Ok(map)), (r#"{"title":"x"}"#.into(), String::new()));
        assert_eq!(render(Ok(Value::Null)), ("null".into(), String::new()));

        assert_eq!(render(Err("boom".into())), (String::new(), "boom".into()));
        assert_eq!(render(Err("  ".into())), (String::new(), UNKNOWN_ERROR.into()));
    }

    #[test]
    fn test_unserializable_value_becomes_error() {
        let (result, error) = render(Ok(Value::Asset(Asset::new(vec![1], "image/png", "a.png"))));
        assert!(result.is_empty());
        assert!(!error.is_empty());

        let (result, error) = render(Ok(Value::Number(f64::NAN)));
        assert!(result.is_empty());
        assert!(!error.is_empty());
    }

    #[tokio::test]
    async fn test_write_marks_done() {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let task_id = running_task(&store);
        let writer = ResultWriter::new(store.clone(), 0);

        writer.write(&task_id, Err("runtime error: x is not defined".into())).await.unwrap();

        let task = store.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.result.as_deref(), Some(""));
        assert_eq!(task.error.as_deref(), Some("runtime error: x is not defined"));
        assert!(task.done_at.is_some());
    }

    #[tokio::test]
    async fn test_second_write_is_rejected() {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let task_id = running_task(&store);
        let writer = ResultWriter::new(store.clone(), 3).with_retry_delay(Duration::from_millis(1));

        writer.write(&task_id, Ok(Value::from("first"))).await.unwrap();
        assert!(writer.write(&task_id, Ok(Value::from("second"))).await.is_err());
        assert_eq!(store.get_task(&task_id).unwrap().result.as_deref(), Some("first"));
    }

    /// Fails the first `failures` writes with a transient store error.
    struct FlakyWrites {
        inner: Arc<SqliteTaskStore>,
        failures: usize,
        calls: AtomicUsize,
    }

    impl TaskStore for FlakyWrites {
        fn get_due_crontabs(&self, now: DateTime<Utc>) -> Result<Vec<Crontab>> {
            self.inner.get_due_crontabs(now)
        }
        fn insert_pending_task(&self, function_id: &str, cron_id: Option<&str>) -> Result<TaskId> {
            self.inner.insert_pending_task(function_id, cron_id)
        }
        fn claim_next_pending_task(&self, now: DateTime<Utc>) -> Result<Option<ClaimedTask>> {
            self.inner.claim_next_pending_task(now)
        }
        fn get_function(&self, function_id: &str) -> Result<Function> {
            self.inner.get_function(function_id)
        }
        fn update_cron_next_run(&self, cron_id: &str, next_run_at: DateTime<Utc>) -> Result<()> {
            self.inner.update_cron_next_run(cron_id, next_run_at)
        }
        fn write_result(&self, task_id: &str, result: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(BusTrackError::Store("database is locked".into()));
            }
            self.inner.write_result(task_id, result, error, now)
        }
        fn reap_running_tasks(
            &self,
            started_before: DateTime<Utc>,
            keep: &[TaskId],
            error: &str,
            now: DateTime<Utc>,
        ) -> Result<usize> {
            self.inner.reap_running_tasks(started_before, keep, error, now)
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let inner = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let task_id = running_task(&inner);
        let flaky = Arc::new(FlakyWrites {
            inner: inner.clone(),
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let writer = ResultWriter::new(flaky.clone(), 3).with_retry_delay(Duration::from_millis(1));

        writer.write(&task_id, Ok(Value::Bool(true))).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(inner.get_task(&task_id).unwrap().result.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let inner = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let task_id = running_task(&inner);
        let flaky = Arc::new(FlakyWrites {
            inner: inner.clone(),
            failures: 10,
            calls: AtomicUsize::new(0),
        });
        let writer = ResultWriter::new(flaky.clone(), 2).with_retry_delay(Duration::from_millis(1));

        assert!(writer.write(&task_id, Ok(Value::Null)).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(inner.get_task(&task_id).unwrap().status, TaskStatus::Running);
    }
}
