//! The Task Store contract consumed by the scheduling pipeline.

use bustrack_core::{ClaimedTask, Crontab, Function, Result};
use chrono::{DateTime, Utc};

pub type TaskId = String;

/// Atomic read-modify-write operations over functions, tasks, and crontabs.
///
/// Implementations must make [`claim_next_pending_task`](TaskStore::claim_next_pending_task)
/// exclusive: under concurrent callers, a given task is handed out once.
pub trait TaskStore: Send + Sync {
    /// Crontabs whose `next_run_at` is at or before `now`.
    fn get_due_crontabs(&self, now: DateTime<Utc>) -> Result<Vec<Crontab>>;

    /// Insert a `pending` task, optionally tagged with the crontab that produced it.
    fn insert_pending_task(&self, function_id: &str, cron_id: Option<&str>) -> Result<TaskId>;

    /// Pick the oldest pending task, move it to `running`, and stamp `started_at`.
    /// Returns `None` when nothing is pending.
    fn claim_next_pending_task(&self, now: DateTime<Utc>) -> Result<Option<ClaimedTask>>;

    fn get_function(&self, function_id: &str) -> Result<Function>;

    fn update_cron_next_run(&self, cron_id: &str, next_run_at: DateTime<Utc>) -> Result<()>;

    /// Persist the terminal record: `status = done`, `done_at = now`.
    fn write_result(&self, task_id: &str, result: &str, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Insert the crontab's task and advance its `next_run_at`.
    ///
    /// The default composes the two writes without a transaction, so a failed
    /// advance leaves the inserted task behind and the crontab still due.
    /// Transactional backends override this to make both writes one unit.
    fn fire_crontab(&self, crontab: &Crontab, next_run_at: DateTime<Utc>) -> Result<TaskId> {
        let task_id = self.insert_pending_task(&crontab.function_id, Some(&crontab.id))?;
        self.update_cron_next_run(&crontab.id, next_run_at)?;
        Ok(task_id)
    }

    /// Terminate tasks left `running` since before `started_before` (their worker
    /// died mid-run), except those in `keep`. Returns how many were closed.
    fn reap_running_tasks(
        &self,
        started_before: DateTime<Utc>,
        keep: &[TaskId],
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize>;
}
