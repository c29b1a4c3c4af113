//! Standard capability bindings registered into every sandbox.

pub mod basic;
pub mod browser;
pub mod fetch;
pub mod query;

use bustrack_core::config::{BrowserConfig, HttpConfig};
use tokio::runtime::Handle;

use crate::capability::CapabilityTable;
use crate::error::ScriptError;

pub use fetch::GetCapability;

/// Build the full table: `get`, `query`, `query_attr`, `query_html`,
/// `number`, `sleep`, `browse`, `screenshot`.
///
/// Async bindings run on `handle` via `block_on`, so calls must come from a
/// thread outside the runtime's async workers (the execution worker runs
/// sandboxes on the blocking pool). Each of them gives up with
/// `ScriptError::Cancelled` once the run's token fires.
pub fn standard(
    http: &HttpConfig,
    browser: &BrowserConfig,
    handle: Handle,
) -> Result<CapabilityTable, ScriptError> {
    let mut table = CapabilityTable::new();
    table.register(GetCapability::new(http, handle.clone())?);
    query::register(&mut table);
    basic::register(&mut table, handle.clone());
    browser::register(&mut table, browser, handle);
    Ok(table)
}
