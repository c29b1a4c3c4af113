//! # BusTrack Sandbox
//!
//! Isolated execution of a function's code against a narrow, explicit set of
//! host capabilities.
//!
//! ```text
//! Sandbox::new(engine, code, env, capabilities) ──► compile
//!        │
//!        └─ run() ──► Value | ScriptError        (blocking; cancellable)
//!
//! ScriptEngine
//!   └── ProcessEngine   external interpreter, JSON-lines capability bridge
//! ```

pub mod cancel;
pub mod capabilities;
pub mod capability;
pub mod error;
pub mod process;
pub mod sandbox;
pub mod wire;

pub use cancel::{CancellationToken, block_on_cancellable};
pub use capability::{Capability, CapabilityTable, FnCapability};
pub use error::ScriptError;
pub use process::ProcessEngine;
pub use sandbox::{Program, RunContext, Sandbox, ScriptEngine};
