//! # BusTrack Store
//!
//! Durable state for functions, tasks, and crontabs. The pipeline talks to
//! the [`TaskStore`] trait; [`SqliteTaskStore`] is the production backend.

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteTaskStore;
pub use store::{TaskId, TaskStore};
