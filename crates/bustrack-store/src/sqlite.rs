//! SQLite-backed Task Store.
//!
//! Functions, their environment bindings, crontabs, and tasks live in one
//! database file. Claims run inside `BEGIN IMMEDIATE` transactions, so the
//! exclusivity guarantee holds across connections and processes sharing the
//! file, not only across threads sharing this handle.

use bustrack_core::types::{format_timestamp, parse_timestamp};
use bustrack_core::{BusTrackError, ClaimedTask, Crontab, Function, Result, Task};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::store::{TaskId, TaskStore};

/// SQLite Task Store.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

/// Shared SELECT column list for task queries.
const TASK_SELECT: &str =
    "SELECT id, function_id, status, created_at, started_at, done_at, result, error, cron_id FROM tasks";

const CRONTAB_SELECT: &str = "SELECT id, function_id, user_id, expression, next_run_at FROM crontabs";

fn store_err(context: &str) -> impl Fn(rusqlite::Error) -> BusTrackError + '_ {
    move |e| BusTrackError::Store(format!("{context}: {e}"))
}

fn opt_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_timestamp(&s)).transpose()
}

/// Raw task row; timestamps and status still textual.
struct TaskRow {
    id: String,
    function_id: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    done_at: Option<String>,
    result: Option<String>,
    error: Option<String>,
    cron_id: Option<String>,
}

fn row_to_task_row(row: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?, function_id: row.get(1)?, status: row.get(2)?,
        created_at: row.get(3)?, started_at: row.get(4)?, done_at: row.get(5)?,
        result: row.get(6)?, error: row.get(7)?, cron_id: row.get(8)?,
    })
}

impl TryFrom<TaskRow> for Task {
    type Error = BusTrackError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Task {
            id: row.id,
            function_id: row.function_id,
            status: row.status.parse()?,
            created_at: parse_timestamp(&row.created_at)?,
            started_at: opt_timestamp(row.started_at)?,
            done_at: opt_timestamp(row.done_at)?,
            result: row.result,
            error: row.error,
            cron_id: row.cron_id,
        })
    }
}

/// Raw crontab row; `next_run_at` still textual.
struct CrontabRow {
    id: String,
    function_id: String,
    user_id: String,
    expression: String,
    next_run_at: String,
}

fn row_to_crontab_row(row: &rusqlite::Row) -> rusqlite::Result<CrontabRow> {
    Ok(CrontabRow {
        id: row.get(0)?, function_id: row.get(1)?, user_id: row.get(2)?,
        expression: row.get(3)?, next_run_at: row.get(4)?,
    })
}

impl TryFrom<CrontabRow> for Crontab {
    type Error = BusTrackError;

    fn try_from(row: CrontabRow) -> Result<Self> {
        Ok(Crontab {
            id: row.id,
            function_id: row.function_id,
            user_id: row.user_id,
            expression: row.expression,
            next_run_at: parse_timestamp(&row.next_run_at)?,
        })
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl SqliteTaskStore {
    /// Open or create the database. `:memory:` gives a private in-memory store.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(store_err("DB open"))?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(store_err("DB pragma"))?;

        // WAL lets pollers in other processes read while one of them claims.
        let _: Option<String> = conn
            .query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))
            .optional()
            .map_err(store_err("DB pragma"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(store_err("DB pragma"))?;

        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Open a private in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| BusTrackError::Store(format!("Lock: {e}")))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS functions (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Environment bindings injected into the sandbox
            CREATE TABLE IF NOT EXISTS function_env (
                function_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (function_id, key),
                FOREIGN KEY (function_id) REFERENCES functions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS crontabs (
                id TEXT PRIMARY KEY,
                function_id TEXT NOT NULL,
                user_id TEXT NOT NULL DEFAULT '',
                expression TEXT NOT NULL,
                next_run_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_crontabs_next_run ON crontabs(next_run_at);

            -- seq fixes the claim order (insertion order)
            CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                function_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                started_at TEXT,
                done_at TEXT,
                result TEXT,
                error TEXT,
                cron_id TEXT REFERENCES crontabs(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, seq);
            ",
        )
        .map_err(store_err("Migration"))?;
        Ok(())
    }

    // ─── Functions ────────────────────────────────────────────

    /// Create or replace a function together with its environment bindings.
    pub fn upsert_function(&self, function: &Function) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err("Upsert function"))?;
        let now = format_timestamp(Utc::now());
        tx.execute(
            "INSERT INTO functions (id, code, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET code = excluded.code, updated_at = excluded.updated_at",
            params![function.id, function.code, now],
        )
        .map_err(store_err("Upsert function"))?;
        tx.execute("DELETE FROM function_env WHERE function_id = ?1", params![function.id])
            .map_err(store_err("Upsert function env"))?;
        for (key, value) in &function.env {
            tx.execute(
                "INSERT INTO function_env (function_id, key, value) VALUES (?1, ?2, ?3)",
                params![function.id, key, value],
            )
            .map_err(store_err("Upsert function env"))?;
        }
        tx.commit().map_err(store_err("Upsert function"))?;
        tracing::debug!(function_id = %function.id, env = function.env.len(), "function stored");
        Ok(())
    }

    // ─── Crontabs ─────────────────────────────────────────────

    /// Register a schedule. `next_run_at` is the first fire time.
    pub fn add_crontab(
        &self,
        function_id: &str,
        user_id: &str,
        expression: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Crontab> {
        let crontab = Crontab {
            id: new_id(),
            function_id: function_id.to_string(),
            user_id: user_id.to_string(),
            expression: expression.to_string(),
            next_run_at,
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO crontabs (id, function_id, user_id, expression, next_run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                crontab.id,
                crontab.function_id,
                crontab.user_id,
                crontab.expression,
                format_timestamp(next_run_at),
                format_timestamp(Utc::now()),
            ],
        )
        .map_err(store_err("Add crontab"))?;
        Ok(crontab)
    }

    pub fn get_crontab(&self, id: &str) -> Result<Crontab> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(&format!("{CRONTAB_SELECT} WHERE id = ?1"), params![id], row_to_crontab_row)
            .optional()
            .map_err(store_err("Get crontab"))?
            .ok_or_else(|| BusTrackError::NotFound(format!("crontab {id}")))?;
        Crontab::try_from(raw)
    }

    pub fn list_crontabs(&self) -> Result<Vec<Crontab>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{CRONTAB_SELECT} ORDER BY next_run_at"))
            .map_err(store_err("List crontabs"))?;
        let rows = stmt
            .query_map([], row_to_crontab_row)
            .map_err(store_err("List crontabs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List crontabs"))?;
        rows.into_iter().map(Crontab::try_from).collect()
    }

    // ─── Tasks ────────────────────────────────────────────────

    pub fn get_task(&self, id: &str) -> Result<Task> {
        let conn = self.lock()?;
        let row = conn
            .query_row(&format!("{TASK_SELECT} WHERE id = ?1"), params![id], row_to_task_row)
            .optional()
            .map_err(store_err("Get task"))?
            .ok_or_else(|| BusTrackError::NotFound(format!("task {id}")))?;
        Task::try_from(row)
    }

    /// Most recent tasks first.
    pub fn list_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{TASK_SELECT} ORDER BY seq DESC LIMIT ?1"))
            .map_err(store_err("List tasks"))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_task_row)
            .map_err(store_err("List tasks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List tasks"))?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Tasks generated by one crontab, oldest first.
    pub fn tasks_for_crontab(&self, cron_id: &str) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{TASK_SELECT} WHERE cron_id = ?1 ORDER BY seq"))
            .map_err(store_err("List tasks"))?;
        let rows = stmt
            .query_map(params![cron_id], row_to_task_row)
            .map_err(store_err("List tasks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List tasks"))?;
        rows.into_iter().map(Task::try_from).collect()
    }
}

fn insert_task(conn: &Connection, function_id: &str, cron_id: Option<&str>) -> Result<TaskId> {
    let id = new_id();
    conn.execute(
        "INSERT INTO tasks (id, function_id, status, created_at, cron_id) VALUES (?1, ?2, 'pending', ?3, ?4)",
        params![id, function_id, format_timestamp(Utc::now()), cron_id],
    )
    .map_err(store_err("Insert task"))?;
    Ok(id)
}

/// Set `next_run_at`. With `expected`, only while the stored value still
/// equals it; a mismatch means another scheduler already fired this window.
fn advance_crontab(
    conn: &Connection,
    cron_id: &str,
    expected: Option<DateTime<Utc>>,
    next_run_at: DateTime<Utc>,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE crontabs SET next_run_at = ?1 WHERE id = ?2 AND (?3 IS NULL OR next_run_at = ?3)",
            params![format_timestamp(next_run_at), cron_id, expected.map(format_timestamp)],
        )
        .map_err(store_err("Advance crontab"))?;
    if changed > 0 {
        return Ok(());
    }
    let exists = conn
        .query_row("SELECT 1 FROM crontabs WHERE id = ?1", params![cron_id], |_| Ok(()))
        .optional()
        .map_err(store_err("Advance crontab"))?
        .is_some();
    match (exists, expected) {
        (true, Some(expected)) => Err(BusTrackError::Conflict(format!(
            "crontab {cron_id} already advanced past {expected}"
        ))),
        _ => Err(BusTrackError::NotFound(format!("crontab {cron_id}"))),
    }
}

impl TaskStore for SqliteTaskStore {
    fn get_due_crontabs(&self, now: DateTime<Utc>) -> Result<Vec<Crontab>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{CRONTAB_SELECT} WHERE next_run_at <= ?1 ORDER BY next_run_at, id"))
            .map_err(store_err("Due crontabs"))?;
        let rows = stmt
            .query_map(params![format_timestamp(now)], row_to_crontab_row)
            .map_err(store_err("Due crontabs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Due crontabs"))?;
        rows.into_iter().map(Crontab::try_from).collect()
    }

    fn insert_pending_task(&self, function_id: &str, cron_id: Option<&str>) -> Result<TaskId> {
        let conn = self.lock()?;
        insert_task(&conn, function_id, cron_id)
    }

    fn claim_next_pending_task(&self, now: DateTime<Utc>) -> Result<Option<ClaimedTask>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err("Claim"))?;

        let candidate: Option<(String, String)> = tx
            .query_row(
                "SELECT id, function_id FROM tasks
                 WHERE status = 'pending' AND done_at IS NULL
                 ORDER BY seq LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(store_err("Claim"))?;

        let Some((task_id, function_id)) = candidate else {
            return Ok(None);
        };

        let changed = tx
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![format_timestamp(now), task_id],
            )
            .map_err(store_err("Claim"))?;
        if changed != 1 {
            return Ok(None);
        }
        tx.commit().map_err(store_err("Claim"))?;

        Ok(Some(ClaimedTask {
            task_id,
            function_id,
            started_at: now,
        }))
    }

    fn get_function(&self, function_id: &str) -> Result<Function> {
        let conn = self.lock()?;
        let code: String = conn
            .query_row("SELECT code FROM functions WHERE id = ?1", params![function_id], |r| r.get(0))
            .optional()
            .map_err(store_err("Get function"))?
            .ok_or_else(|| BusTrackError::NotFound(format!("function {function_id}")))?;

        let mut stmt = conn
            .prepare("SELECT key, value FROM function_env WHERE function_id = ?1")
            .map_err(store_err("Get function env"))?;
        let env = stmt
            .query_map(params![function_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(store_err("Get function env"))?
            .collect::<rusqlite::Result<BTreeMap<String, String>>>()
            .map_err(store_err("Get function env"))?;

        Ok(Function {
            id: function_id.to_string(),
            code,
            env,
        })
    }

    fn update_cron_next_run(&self, cron_id: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        advance_crontab(&conn, cron_id, None, next_run_at)
    }

    fn write_result(&self, task_id: &str, result: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'done', done_at = ?1, result = ?2, error = ?3
                 WHERE id = ?4 AND status = 'running'",
                params![format_timestamp(now), result, error, task_id],
            )
            .map_err(store_err("Write result"))?;
        if changed == 0 {
            return Err(BusTrackError::Store(format!("task {task_id} is not running")));
        }
        Ok(())
    }

    fn fire_crontab(&self, crontab: &Crontab, next_run_at: DateTime<Utc>) -> Result<TaskId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err("Fire crontab"))?;
        let task_id = insert_task(&tx, &crontab.function_id, Some(&crontab.id))?;
        advance_crontab(&tx, &crontab.id, Some(crontab.next_run_at), next_run_at)?;
        tx.commit().map_err(store_err("Fire crontab"))?;
        Ok(task_id)
    }

    fn reap_running_tasks(
        &self,
        started_before: DateTime<Utc>,
        keep: &[TaskId],
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err("Reap tasks"))?;

        let stale = {
            let mut stmt = tx
                .prepare("SELECT id FROM tasks WHERE status = 'running' AND (started_at IS NULL OR started_at < ?1)")
                .map_err(store_err("Reap tasks"))?;
            stmt.query_map(params![format_timestamp(started_before)], |r| r.get::<_, String>(0))
                .map_err(store_err("Reap tasks"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err("Reap tasks"))?
        };

        let mut reaped = 0;
        for id in stale.iter().filter(|id| !keep.contains(id)) {
            reaped += tx
                .execute(
                    "UPDATE tasks SET status = 'done', done_at = ?1, result = '', error = ?2
                     WHERE id = ?3 AND status = 'running'",
                    params![format_timestamp(now), error, id],
                )
                .map_err(store_err("Reap tasks"))?;
        }
        tx.commit().map_err(store_err("Reap tasks"))?;
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bustrack_core::TaskStatus;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn temp_db() -> SqliteTaskStore {
        SqliteTaskStore::in_memory().unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, h, m, 0).unwrap()
    }

    fn function(id: &str) -> Function {
        let mut env = BTreeMap::new();
        env.insert("TOKEN".to_string(), "secret".to_string());
        Function { id: id.into(), code: "return 1".into(), env }
    }

    #[test]
    fn test_function_roundtrip_and_env_replace() {
        let db = temp_db();
        let mut f = function("f1");
        db.upsert_function(&f).unwrap();
        assert_eq!(db.get_function("f1").unwrap(), f);

        f.env.clear();
        f.env.insert("OTHER".into(), "1".into());
        f.code = "return 2".into();
        db.upsert_function(&f).unwrap();
        let loaded = db.get_function("f1").unwrap();
        assert_eq!(loaded.code, "return 2");
        assert_eq!(loaded.env.len(), 1);
        assert_eq!(loaded.env["OTHER"], "1");

        assert!(matches!(db.get_function("nope"), Err(BusTrackError::NotFound(_))));
    }

    #[test]
    fn test_claim_in_insertion_order() {
        let db = temp_db();
        let first = db.insert_pending_task("f1", None).unwrap();
        let second = db.insert_pending_task("f2", None).unwrap();

        let claimed = db.claim_next_pending_task(at(12, 0)).unwrap().unwrap();
        assert_eq!(claimed.task_id, first);
        assert_eq!(claimed.function_id, "f1");

        let task = db.get_task(&first).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.started_at, Some(at(12, 0)));

        let claimed = db.claim_next_pending_task(at(12, 1)).unwrap().unwrap();
        assert_eq!(claimed.task_id, second);
        assert!(db.claim_next_pending_task(at(12, 2)).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let db = Arc::new(temp_db());
        db.insert_pending_task("f1", None).unwrap();

        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let db = Arc::clone(&db);
                    s.spawn(move || db.claim_next_pending_task(Utc::now()).unwrap().is_some())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_claims_across_connections() {
        let dir = std::env::temp_dir().join(format!("bustrack-claim-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tasks.db");
        SqliteTaskStore::open(&path).unwrap().insert_pending_task("f1", None).unwrap();

        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let path = path.clone();
                    s.spawn(move || {
                        let db = SqliteTaskStore::open(&path).unwrap();
                        db.claim_next_pending_task(Utc::now()).unwrap().is_some()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(winners, 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_write_result_is_terminal() {
        let db = temp_db();
        let id = db.insert_pending_task("f1", None).unwrap();

        // Not yet running, nothing to terminate.
        assert!(db.write_result(&id, "x", "", at(12, 0)).is_err());

        db.claim_next_pending_task(at(12, 0)).unwrap();
        db.write_result(&id, "{\"title\":\"x\"}", "", at(12, 1)).unwrap();
        let task = db.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.done_at, Some(at(12, 1)));
        assert_eq!(task.result.as_deref(), Some("{\"title\":\"x\"}"));
        assert_eq!(task.error.as_deref(), Some(""));

        // done is terminal
        assert!(db.write_result(&id, "again", "", at(12, 2)).is_err());
        assert_eq!(db.get_task(&id).unwrap().done_at, Some(at(12, 1)));
    }

    #[test]
    fn test_due_crontabs() {
        let db = temp_db();
        let due = db.add_crontab("f1", "u1", "0 * * * *", at(12, 0)).unwrap();
        db.add_crontab("f2", "u1", "0 * * * *", at(13, 0)).unwrap();

        let found = db.get_due_crontabs(at(12, 1)).unwrap();
        assert_eq!(found, vec![due.clone()]);
        assert_eq!(db.get_due_crontabs(at(12, 0)).unwrap().len(), 1);
        assert!(db.get_due_crontabs(at(11, 59)).unwrap().is_empty());

        db.update_cron_next_run(&due.id, at(13, 0)).unwrap();
        assert!(db.get_due_crontabs(at(12, 1)).unwrap().is_empty());
        assert!(db.update_cron_next_run("missing", at(13, 0)).is_err());
    }

    #[test]
    fn test_fire_crontab_inserts_and_advances() {
        let db = temp_db();
        let cron = db.add_crontab("f1", "u1", "0 * * * *", at(12, 0)).unwrap();
        let task_id = db.fire_crontab(&cron, at(13, 0)).unwrap();

        let task = db.get_task(&task_id).unwrap();
        assert_eq!(task.cron_id.as_deref(), Some(cron.id.as_str()));
        assert_eq!(task.function_id, "f1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(db.get_crontab(&cron.id).unwrap().next_run_at, at(13, 0));
    }

    #[test]
    fn test_fire_crontab_rolls_back_when_advance_fails() {
        let db = temp_db();
        let cron = db.add_crontab("f1", "u1", "0 * * * *", at(12, 0)).unwrap();
        db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER refuse_advance BEFORE UPDATE OF next_run_at ON crontabs
                 BEGIN SELECT RAISE(ABORT, 'advance refused'); END;",
            )
            .unwrap();

        assert!(db.fire_crontab(&cron, at(13, 0)).is_err());
        assert!(db.tasks_for_crontab(&cron.id).unwrap().is_empty());
        assert_eq!(db.get_crontab(&cron.id).unwrap().next_run_at, at(12, 0));
    }

    #[test]
    fn test_fire_crontab_from_stale_snapshot_loses() {
        let db = temp_db();
        let cron = db.add_crontab("f1", "u1", "0 * * * *", at(12, 0)).unwrap();
        db.fire_crontab(&cron, at(13, 0)).unwrap();

        // A second scheduler that read the crontab before the first fired it.
        let err = db.fire_crontab(&cron, at(13, 0)).unwrap_err();
        assert!(matches!(err, BusTrackError::Conflict(_)), "{err}");
        assert_eq!(db.tasks_for_crontab(&cron.id).unwrap().len(), 1);
        assert_eq!(db.get_crontab(&cron.id).unwrap().next_run_at, at(13, 0));
    }

    #[test]
    fn test_reap_only_stale_running_tasks() {
        let db = temp_db();
        let stale = db.insert_pending_task("f1", None).unwrap();
        let fresh = db.insert_pending_task("f1", None).unwrap();
        let waiting = db.insert_pending_task("f1", None).unwrap();
        db.claim_next_pending_task(at(10, 0)).unwrap();
        db.claim_next_pending_task(at(12, 0)).unwrap();

        let reaped = db.reap_running_tasks(at(11, 0), &[], "worker exited", at(12, 5)).unwrap();
        assert_eq!(reaped, 1);

        let task = db.get_task(&stale).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.error.as_deref(), Some("worker exited"));
        assert_eq!(task.result.as_deref(), Some(""));
        assert_eq!(db.get_task(&fresh).unwrap().status, TaskStatus::Running);
        assert_eq!(db.get_task(&waiting).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_reap_keeps_listed_tasks() {
        let db = temp_db();
        let kept = db.insert_pending_task("f1", None).unwrap();
        let orphan = db.insert_pending_task("f1", None).unwrap();
        db.claim_next_pending_task(at(10, 0)).unwrap();
        db.claim_next_pending_task(at(10, 0)).unwrap();

        let reaped = db
            .reap_running_tasks(at(11, 0), std::slice::from_ref(&kept), "worker exited", at(12, 5))
            .unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(db.get_task(&kept).unwrap().status, TaskStatus::Running);
        assert_eq!(db.get_task(&orphan).unwrap().status, TaskStatus::Done);

        // The kept task can still be finished by its worker.
        db.write_result(&kept, "ok", "", at(12, 6)).unwrap();
        assert_eq!(db.get_task(&kept).unwrap().result.as_deref(), Some("ok"));
    }

    #[test]
    fn test_list_tasks_newest_first() {
        let db = temp_db();
        let a = db.insert_pending_task("f1", None).unwrap();
        let b = db.insert_pending_task("f1", None).unwrap();
        let listed = db.list_tasks(10).unwrap();
        assert_eq!(listed.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec![b.as_str(), a.as_str()]);
        assert_eq!(db.list_tasks(1).unwrap().len(), 1);
    }
}
