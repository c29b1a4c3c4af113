//! Cron Manager: turns due crontabs into pending tasks.

use bustrack_core::{BusTrackError, Crontab, Result};
use bustrack_store::{TaskId, TaskStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::cron;

/// Outcome of one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CronTick {
    /// `(cron_id, task_id)` for every crontab that fired.
    pub fired: Vec<(String, TaskId)>,
    /// Crontabs that were due but failed; they stay due.
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct CronManager {
    store: Arc<dyn TaskStore>,
}

impl CronManager {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Fire every crontab due at `now`, once each, no catch-up.
    ///
    /// Only a failure to list due crontabs is returned; per-crontab failures
    /// are logged and reported in [`CronTick::failed`]. A crontab another
    /// scheduler advanced first is neither fired nor failed.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<CronTick> {
        let due = self.store.get_due_crontabs(now)?;
        let mut report = CronTick::default();

        for crontab in due {
            match self.fire(&crontab, now) {
                Ok((task_id, next_run_at)) => {
                    tracing::info!(
                        cron_id = %crontab.id,
                        function_id = %crontab.function_id,
                        task_id = %task_id,
                        next_run_at = %next_run_at,
                        "⏰ Crontab fired"
                    );
                    report.fired.push((crontab.id.clone(), task_id));
                }
                Err(BusTrackError::Conflict(reason)) => {
                    tracing::debug!(cron_id = %crontab.id, "Crontab fired elsewhere: {reason}");
                }
                Err(e) => {
                    tracing::warn!(
                        cron_id = %crontab.id,
                        expression = %crontab.expression,
                        "⚠️ Crontab skipped: {e}"
                    );
                    report.failed.push(crontab.id.clone());
                }
            }
        }
        Ok(report)
    }

    fn fire(&self, crontab: &Crontab, now: DateTime<Utc>) -> Result<(TaskId, DateTime<Utc>)> {
        // Parse before any write: a bad expression inserts nothing.
        let next_run_at = cron::next_run_from_cron(&crontab.expression, now)?;
        if next_run_at <= crontab.next_run_at {
            return Err(BusTrackError::Cron(format!(
                "next run {next_run_at} does not advance past {}",
                crontab.next_run_at
            )));
        }
        let task_id = self.store.fire_crontab(crontab, next_run_at)?;
        Ok((task_id, next_run_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bustrack_core::{ClaimedTask, Function, TaskStatus};
    use bustrack_store::SqliteTaskStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, h, m, 0).unwrap()
    }

    fn store_with_function() -> Arc<SqliteTaskStore> {
        let store = SqliteTaskStore::in_memory().unwrap();
        store
            .upsert_function(&Function {
                id: "fn-1".into(),
                code: "return 1".into(),
                env: Default::default(),
            })
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_due_crontab_fires_once_and_advances() {
        let store = store_with_function();
        let cron = store.add_crontab("fn-1", "user-1", "0 * * * *", at(12, 0)).unwrap();
        let manager = CronManager::new(store.clone());

        let report = manager.tick(at(12, 1)).unwrap();
        assert_eq!(report.fired.len(), 1);
        assert!(report.failed.is_empty());

        let (cron_id, task_id) = &report.fired[0];
        assert_eq!(cron_id, &cron.id);
        let task = store.get_task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.function_id, "fn-1");
        assert_eq!(task.cron_id.as_deref(), Some(cron.id.as_str()));
        assert_eq!(store.get_crontab(&cron.id).unwrap().next_run_at, at(13, 0));

        // Not due again until 13:00.
        assert!(manager.tick(at(12, 30)).unwrap().fired.is_empty());
    }

    #[test]
    fn test_missed_windows_fire_once() {
        let store = store_with_function();
        let cron = store.add_crontab("fn-1", "user-1", "*/5 * * * *", at(9, 0)).unwrap();
        let manager = CronManager::new(store.clone());

        // Three hours late: one task, then skip forward.
        let report = manager.tick(at(12, 2)).unwrap();
        assert_eq!(report.fired.len(), 1);
        assert_eq!(store.tasks_for_crontab(&cron.id).unwrap().len(), 1);
        assert_eq!(store.get_crontab(&cron.id).unwrap().next_run_at, at(12, 5));
    }

    #[test]
    fn test_bad_expression_does_not_block_others() {
        let store = store_with_function();
        let bad = store.add_crontab("fn-1", "user-1", "61 * * * *", at(12, 0)).unwrap();
        let good = store.add_crontab("fn-1", "user-1", "0 * * * *", at(12, 0)).unwrap();
        let manager = CronManager::new(store.clone());

        let report = manager.tick(at(12, 1)).unwrap();
        assert_eq!(report.failed, vec![bad.id.clone()]);
        assert_eq!(report.fired.len(), 1);
        assert_eq!(report.fired[0].0, good.id);

        // The broken one inserted nothing and is still due.
        assert!(store.tasks_for_crontab(&bad.id).unwrap().is_empty());
        assert_eq!(store.get_crontab(&bad.id).unwrap().next_run_at, at(12, 0));
    }

    /// Store wrapper whose `update_cron_next_run` fails while `broken` is set.
    /// Uses the trait's non-transactional `fire_crontab`.
    struct FlakyAdvance {
        inner: Arc<SqliteTaskStore>,
        broken: AtomicBool,
    }

    impl TaskStore for FlakyAdvance {
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
            if self.broken.load(Ordering::SeqCst) {
                return Err(BusTrackError::Store("disk I/O error".into()));
            }
            self.inner.update_cron_next_run(cron_id, next_run_at)
        }
        fn write_result(&self, task_id: &str, result: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
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

    #[test]
    fn test_failed_advance_without_transaction_double_fires() {
        let inner = store_with_function();
        let cron = inner.add_crontab("fn-1", "user-1", "0 * * * *", at(12, 0)).unwrap();
        let flaky = Arc::new(FlakyAdvance {
            inner: inner.clone(),
            broken: AtomicBool::new(true),
        });
        let manager = CronManager::new(flaky.clone());

        // Insert succeeded, advance failed: task exists, crontab still due.
        let report = manager.tick(at(12, 1)).unwrap();
        assert_eq!(report.failed, vec![cron.id.clone()]);
        assert_eq!(inner.tasks_for_crontab(&cron.id).unwrap().len(), 1);
        assert_eq!(inner.get_crontab(&cron.id).unwrap().next_run_at, at(12, 0));

        // Next tick retries the advance and inserts a second task for the same window.
        flaky.broken.store(false, Ordering::SeqCst);
        let report = manager.tick(at(12, 2)).unwrap();
        assert_eq!(report.fired.len(), 1);
        assert_eq!(inner.tasks_for_crontab(&cron.id).unwrap().len(), 2);
        assert_eq!(inner.get_crontab(&cron.id).unwrap().next_run_at, at(13, 0));
    }

    #[test]
    fn test_transactional_store_never_double_fires() {
        let store = store_with_function();
        let cron = store.add_crontab("fn-1", "user-1", "0 * * * *", at(12, 0)).unwrap();
        let manager = CronManager::new(store.clone());

        manager.tick(at(12, 1)).unwrap();
        manager.tick(at(12, 2)).unwrap();
        manager.tick(at(12, 59)).unwrap();
        assert_eq!(store.tasks_for_crontab(&cron.id).unwrap().len(), 1);

        manager.tick(at(13, 0)).unwrap();
        assert_eq!(store.tasks_for_crontab(&cron.id).unwrap().len(), 2);
    }

    #[test]
    fn test_window_fired_by_another_manager_is_skipped() {
        let store = store_with_function();
        let cron = store.add_crontab("fn-1", "user-1", "0 * * * *", at(12, 0)).unwrap();
        let due_snapshot = store.get_due_crontabs(at(12, 1)).unwrap();

        // Another manager fires the window first.
        CronManager::new(store.clone()).tick(at(12, 1)).unwrap();

        let late = CronManager::new(store.clone());
        let err = late.fire(&due_snapshot[0], at(12, 1)).unwrap_err();
        assert!(matches!(err, BusTrackError::Conflict(_)), "{err}");
        assert_eq!(store.tasks_for_crontab(&cron.id).unwrap().len(), 1);
        assert_eq!(store.get_crontab(&cron.id).unwrap().next_run_at, at(13, 0));
    }
}
