//! # BusTrack Scheduler
//!
//! The task pipeline: cron evaluation, exclusive claiming, sandboxed
//! execution, asset materialization, and the terminal write.
//!
//! ## Architecture
//! ```text
//! CronManager (cron timer)
//!   └── due crontab → pending task, next_run_at advanced
//!
//! Poller (poll timer, N worker permits)
//!   └── claim → TaskPipeline
//!                 ├── ExecutionWorker   Sandbox run, timeout, panics caught
//!                 ├── Materializer      assets → Blob Store → {type, url}
//!                 └── ResultWriter      status = done, always
//! ```

pub mod cron;
pub mod cron_manager;
pub mod engine;
pub mod executor;
pub mod materialize;
pub mod pipeline;
pub mod poller;
pub mod writer;

pub use cron::{CronParseError, CronSchedule, next_run_from_cron};
pub use cron_manager::{CronManager, CronTick};
pub use engine::{EngineHandle, SchedulerEngine};
pub use executor::ExecutionWorker;
pub use materialize::Materializer;
pub use pipeline::TaskPipeline;
pub use poller::{InFlight, PollOutcome, Poller};
pub use writer::ResultWriter;
