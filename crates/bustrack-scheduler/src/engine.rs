//! Scheduler Engine: wires the store, sandbox, and blob backend together
//! and runs the two independent timers.
//!
//! ```text
//! cron timer ──► CronManager::tick ──► pending tasks
//! poll timer ──► Poller::poll_once ──► TaskPipeline (one tokio task per claim)
//! ```
//! The timers share nothing but the Task Store.

use bustrack_blob::BlobStore;
use bustrack_core::config::SchedulerConfig;
use bustrack_core::{BusTrackConfig, BusTrackError, Result};
use bustrack_sandbox::{CapabilityTable, ProcessEngine, ScriptEngine, capabilities};
use bustrack_store::{SqliteTaskStore, TaskStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cron_manager::CronManager;
use crate::executor::ExecutionWorker;
use crate::materialize::Materializer;
use crate::pipeline::TaskPipeline;
use crate::poller::{InFlight, Poller};
use crate::writer::ResultWriter;

/// Error recorded on tasks whose worker disappeared mid-run.
pub const ABANDONED_ERROR: &str = "abandoned: worker exited before completion";

/// Extra slack past timeout + grace before a running task counts as orphaned.
const REAP_SLACK: Duration = Duration::from_secs(60);

pub struct SchedulerEngine {
    store: Arc<dyn TaskStore>,
    cron: CronManager,
    poller: Poller,
    config: SchedulerConfig,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        script_engine: Arc<dyn ScriptEngine>,
        capabilities: CapabilityTable,
        blobs: Arc<dyn BlobStore>,
        default_bucket: &str,
        config: &SchedulerConfig,
    ) -> Self {
        let worker = ExecutionWorker::new(
            store.clone(),
            script_engine,
            capabilities,
            config.execution_timeout(),
            config.cancel_grace(),
        );
        let materializer = Materializer::new(blobs, default_bucket, config.upload_concurrency);
        let writer = ResultWriter::new(store.clone(), config.write_retries);
        let pipeline = TaskPipeline::new(worker, materializer, writer);

        Self {
            cron: CronManager::new(store.clone()),
            poller: Poller::new(store.clone(), pipeline, config.workers, config.poll_interval()),
            store,
            config: config.clone(),
        }
    }

    /// Production wiring. Must be called inside a tokio runtime: capabilities
    /// that do async I/O capture the current runtime handle.
    pub fn from_config(config: &BusTrackConfig) -> Result<Self> {
        let db_path = config.database.resolved_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(SqliteTaskStore::open(&db_path)?);
        let blobs = bustrack_blob::from_config(&config.storage)?;
        let engine = Arc::new(ProcessEngine::new(&config.sandbox, tokio::runtime::Handle::current()));
        let capabilities = capabilities::standard(&config.http, &config.browser, tokio::runtime::Handle::current())?;

        tracing::info!(
            db = %db_path.display(),
            storage = %config.storage.backend,
            interpreter = %config.sandbox.command,
            capabilities = capabilities.len(),
            "🔧 Scheduler engine configured"
        );
        Ok(Self::new(
            store,
            engine,
            capabilities,
            blobs,
            &config.storage.bucket,
            &config.scheduler,
        ))
    }

    pub fn cron(&self) -> &CronManager {
        &self.cron
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Close tasks that have been `running` longer than any live worker
    /// could keep them. Tasks this engine still has in flight are kept.
    pub async fn reap_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        reap(
            self.store.clone(),
            &self.poller.in_flight(),
            orphan_cutoff(&self.config),
            now,
        )
        .await
    }

    /// Spawn both timers. Returns a handle for shutdown.
    pub async fn start(self) -> Result<EngineHandle> {
        if self.config.reap_orphans {
            let reaped = self.reap_orphans(Utc::now()).await?;
            if reaped > 0 {
                tracing::warn!("⚠️ Closed {reaped} task(s) abandoned by a previous worker");
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cron = tokio::spawn(spawn_cron_manager(
            self.cron,
            self.store.clone(),
            self.poller.in_flight(),
            self.config.clone(),
            shutdown_rx.clone(),
        ));
        let drain = self.config.execution_timeout() + self.config.cancel_grace();
        let poller = tokio::spawn(self.poller.run(shutdown_rx, drain));

        Ok(EngineHandle {
            shutdown_tx,
            cron,
            poller,
        })
    }
}

pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    cron: JoinHandle<()>,
    poller: JoinHandle<()>,
}

impl EngineHandle {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop both timers and wait for running tasks to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        let (cron, poller) = tokio::join!(self.cron, self.poller);
        cron.map_err(|e| BusTrackError::Store(format!("cron loop panicked: {e}")))?;
        poller.map_err(|e| BusTrackError::Store(format!("poller panicked: {e}")))?;
        Ok(())
    }
}

/// Cron timer: fire due crontabs, then sweep orphaned running tasks
/// other than those in `in_flight`.
pub async fn spawn_cron_manager(
    manager: CronManager,
    store: Arc<dyn TaskStore>,
    in_flight: InFlight,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        "⏰ Cron manager started (check every {}s)",
        config.cron_interval().as_secs()
    );

    let mut interval = tokio::time::interval(config.cron_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("🛑 Cron manager shutting down");
                    break;
                }
            }
            _ = interval.tick() => {
                let now = Utc::now();
                let manager = manager.clone();
                match tokio::task::spawn_blocking(move || manager.tick(now)).await {
                    Ok(Ok(report)) if !report.fired.is_empty() || !report.failed.is_empty() => {
                        tracing::info!(
                            fired = report.fired.len(),
                            failed = report.failed.len(),
                            "⏰ Cron tick"
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("⚠️ Cron tick failed, retrying next tick: {e}"),
                    Err(e) => tracing::error!("🚨 Cron tick panicked: {e}"),
                }

                if config.reap_orphans {
                    match reap(store.clone(), &in_flight, orphan_cutoff(&config), now).await {
                        Ok(0) => {}
                        Ok(n) => tracing::warn!("⚠️ Closed {n} orphaned running task(s)"),
                        Err(e) => tracing::warn!("⚠️ Orphan sweep failed: {e}"),
                    }
                }
            }
        }
    }
}

fn orphan_cutoff(config: &SchedulerConfig) -> Duration {
    config.execution_timeout() + config.cancel_grace() + REAP_SLACK
}

async fn reap(store: Arc<dyn TaskStore>, in_flight: &InFlight, age: Duration, now: DateTime<Utc>) -> Result<usize> {
    let age = chrono::Duration::from_std(age).map_err(|e| BusTrackError::Config(format!("bad timeout: {e}")))?;
    let started_before = now - age;
    let keep = in_flight.ids();
    tokio::task::spawn_blocking(move || store.reap_running_tasks(started_before, &keep, ABANDONED_ERROR, now))
        .await
        .map_err(|e| BusTrackError::Store(format!("reap panicked: {e}")))?
}
