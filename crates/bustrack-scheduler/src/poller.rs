//! Poller / Claimer: claims one pending task per tick and hands it to a
//! free execution worker.
//!
//! A claim is only attempted while a worker permit is free, so a task never
//! sits in `running` waiting for capacity.

use bustrack_core::{ClaimedTask, Result};
use bustrack_store::{TaskId, TaskStore};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};

use crate::pipeline::TaskPipeline;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A task was claimed and dispatched.
    Claimed(String),
    /// Nothing pending.
    Idle,
    /// Every worker is busy; no claim attempted.
    Busy,
    /// The claim failed; retried next tick.
    Failed,
}

/// Tasks this process has claimed and not yet finished writing.
///
/// The orphan sweep leaves these alone however old their claim is.
#[derive(Clone, Default)]
pub struct InFlight(Arc<Mutex<HashSet<TaskId>>>);

impl InFlight {
    fn set(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `task_id` until the returned guard drops.
    fn track(&self, task_id: &str) -> Tracked {
        self.set().insert(task_id.to_string());
        Tracked {
            in_flight: self.clone(),
            task_id: task_id.to_string(),
        }
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.set().iter().cloned().collect()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.set().contains(task_id)
    }
}

struct Tracked {
    in_flight: InFlight,
    task_id: TaskId,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.in_flight.set().remove(&self.task_id);
    }
}

pub struct Poller {
    store: Arc<dyn TaskStore>,
    pipeline: Arc<TaskPipeline>,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
    workers: usize,
    interval: Duration,
}

impl Poller {
    pub fn new(store: Arc<dyn TaskStore>, pipeline: Arc<TaskPipeline>, workers: usize, interval: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            store,
            pipeline,
            permits: Arc::new(Semaphore::new(workers)),
            in_flight: InFlight::default(),
            workers,
            interval,
        }
    }

    /// Number of idle execution workers.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Shared view of the tasks this poller has dispatched and not finished.
    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// One tick: claim at most one task. Never returns an error; failures
    /// are logged and the next tick tries again.
    pub async fn poll_once(&self) -> PollOutcome {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return PollOutcome::Busy;
        };

        let task = match self.claim().await {
            Ok(Some(task)) => task,
            Ok(None) => return PollOutcome::Idle,
            Err(e) => {
                tracing::warn!("⚠️ Claim failed, retrying next tick: {e}");
                return PollOutcome::Failed;
            }
        };

        tracing::info!(task_id = %task.task_id, function_id = %task.function_id, "📥 Task claimed");
        let task_id = task.task_id.clone();
        let tracked = self.in_flight.track(&task_id);
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _tracked = tracked;
            pipeline.process(task).await;
        });
        PollOutcome::Claimed(task_id)
    }

    async fn claim(&self) -> Result<Option<ClaimedTask>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.claim_next_pending_task(Utc::now()))
            .await
            .map_err(|e| bustrack_core::BusTrackError::Store(format!("claim panicked: {e}")))?
    }

    /// Tick until `shutdown` flips to true, then wait up to `drain` for
    /// in-flight tasks. Each tick claims at most one task.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, drain: Duration) {
        tracing::info!(
            "📡 Poller started (every {}ms, {} worker(s))",
            self.interval.as_millis(),
            self.workers
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("🛑 Poller shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.poll_once().await;
                }
            }
        }

        self.wait_for_inflight(drain).await;
    }

    async fn wait_for_inflight(&self, drain: Duration) {
        let busy = self.workers - self.permits.available_permits();
        if busy == 0 {
            return;
        }
        tracing::info!("⏳ Waiting for {busy} running task(s)");
        let all = u32::try_from(self.workers).unwrap_or(u32::MAX);
        match tokio::time::timeout(drain, self.permits.acquire_many(all)).await {
            Ok(_) => tracing::info!("✅ All running tasks finished"),
            Err(_) => tracing::warn!("⚠️ Shutdown with tasks still running; they will be reaped once stale"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionWorker;
    use crate::executor::tests::ScriptedEngine;
    use crate::materialize::Materializer;
    use crate::writer::ResultWriter;
    use bustrack_blob::MemoryBlobStore;
    use bustrack_core::{Function, TaskStatus, Value};
    use bustrack_sandbox::CapabilityTable;
    use bustrack_store::SqliteTaskStore;

    fn setup(engine: ScriptedEngine, workers: usize) -> (Arc<SqliteTaskStore>, Poller) {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        store
            .upsert_function(&Function {
                id: "fn-1".into(),
                code: "work".into(),
                env: Default::default(),
            })
            .unwrap();
        let worker = ExecutionWorker::new(
            store.clone(),
            Arc::new(engine),
            CapabilityTable::new(),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        let pipeline = TaskPipeline::new(
            worker,
            Materializer::new(Arc::new(MemoryBlobStore::new()), "images", 2),
            ResultWriter::new(store.clone(), 0),
        );
        let poller = Poller::new(store.clone(), pipeline, workers, Duration::from_millis(10));
        (store, poller)
    }

    async fn wait_until_done(store: &SqliteTaskStore, task_id: &str) {
        for _ in 0..200 {
            if store.get_task(task_id).unwrap().status == TaskStatus::Done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never finished");
    }

    #[tokio::test]
    async fn test_idle_when_nothing_pending() {
        let (_, poller) = setup(ScriptedEngine::new(|_, _| Ok(Value::Null)), 1);
        assert_eq!(poller.poll_once().await, PollOutcome::Idle);
        assert_eq!(poller.idle_workers(), 1);
    }

    #[tokio::test]
    async fn test_claims_in_insertion_order() {
        let (store, poller) = setup(ScriptedEngine::new(|_, _| Ok(Value::from("ok"))), 2);
        let first = store.insert_pending_task("fn-1", None).unwrap();
        let second = store.insert_pending_task("fn-1", None).unwrap();

        assert_eq!(poller.poll_once().await, PollOutcome::Claimed(first.clone()));
        assert_eq!(poller.poll_once().await, PollOutcome::Claimed(second.clone()));

        wait_until_done(&store, &first).await;
        wait_until_done(&store, &second).await;
        assert_eq!(store.get_task(&first).unwrap().result.as_deref(), Some("ok"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_claim_without_free_worker() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let engine = ScriptedEngine::new(move |_, _| {
            let _ = release_rx.lock().map(|rx| rx.recv_timeout(Duration::from_secs(5)));
            Ok(Value::Null)
        });
        let (store, poller) = setup(engine, 1);
        let first = store.insert_pending_task("fn-1", None).unwrap();
        let second = store.insert_pending_task("fn-1", None).unwrap();

        assert_eq!(poller.poll_once().await, PollOutcome::Claimed(first.clone()));
        assert_eq!(poller.poll_once().await, PollOutcome::Busy);
        // Still pending, not stranded in running.
        assert_eq!(store.get_task(&second).unwrap().status, TaskStatus::Pending);

        release_tx.send(()).unwrap();
        wait_until_done(&store, &first).await;
        // Permit is released after the write.
        for _ in 0..100 {
            if poller.idle_workers() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(poller.poll_once().await, PollOutcome::Claimed(second.clone()));
        release_tx.send(()).unwrap();
        wait_until_done(&store, &second).await;
    }

    #[tokio::test]
    async fn test_broken_script_does_not_stop_polling() {
        let engine = ScriptedEngine::new(|_, _| Err(bustrack_sandbox::ScriptError::Runtime("boom".into())));
        let (store, poller) = setup(engine, 1);
        let bad = store.insert_pending_task("fn-1", None).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(shutdown_rx, Duration::from_secs(2)));
        wait_until_done(&store, &bad).await;

        let next = store.insert_pending_task("fn-1", None).unwrap();
        wait_until_done(&store, &next).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let task = store.get_task(&bad).unwrap();
        assert_eq!(task.error.as_deref(), Some("runtime error: boom"));
        assert_eq!(task.result.as_deref(), Some(""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_one_claim_per_tick_with_idle_workers() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let engine = ScriptedEngine::new(move |_, _| {
            let _ = release_rx.lock().map(|rx| rx.recv_timeout(Duration::from_secs(10)));
            Ok(Value::Null)
        });
        let (store, poller) = setup(engine, 4);
        let poller = Poller {
            interval: Duration::from_secs(1),
            ..poller
        };
        for _ in 0..4 {
            store.insert_pending_task("fn-1", None).unwrap();
        }
        let running = || {
            store
                .list_tasks(10)
                .unwrap()
                .iter()
                .filter(|t| t.status == TaskStatus::Running)
                .count()
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(shutdown_rx, Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(running(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(running(), 2);

        drop(release_tx);
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_tracks_dispatched_tasks() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = std::sync::Mutex::new(Some(release_rx));
        let engine = ScriptedEngine::new(move |_, _| {
            if let Some(rx) = release_rx.lock().ok().and_then(|mut rx| rx.take()) {
                let _ = rx.blocking_recv();
            }
            Ok(Value::Null)
        });
        let (store, poller) = setup(engine, 1);
        let task_id = store.insert_pending_task("fn-1", None).unwrap();
        let in_flight = poller.in_flight();

        assert_eq!(poller.poll_once().await, PollOutcome::Claimed(task_id.clone()));
        assert!(in_flight.contains(&task_id));

        release_tx.send(()).unwrap();
        wait_until_done(&store, &task_id).await;
        for _ in 0..100 {
            if in_flight.ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(in_flight.ids().is_empty());
    }

    #[test]
    fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        store
            .upsert_function(&Function {
                id: "fn-1".into(),
                code: String::new(),
                env: Default::default(),
            })
            .unwrap();
        store.insert_pending_task("fn-1", None).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.claim_next_pending_task(Utc::now()).unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(winners, 1);
    }
}
