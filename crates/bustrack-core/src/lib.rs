//! # BusTrack Core
//!
//! Shared vocabulary for the task pipeline: the stored [`Function`],
//! [`Task`] and [`Crontab`] records, the dynamic result [`Value`] produced
//! by a sandbox run, the TOML configuration and the error taxonomy.

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::BusTrackConfig;
pub use error::{BusTrackError, Result};
pub use types::{ClaimedTask, Crontab, Function, Task, TaskStatus};
pub use value::{Asset, Value};
