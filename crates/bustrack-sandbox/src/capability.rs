//! Capability bindings: the only way a script reaches outside its sandbox.
//!
//! A [`CapabilityTable`] is an explicit name → callable registry handed to
//! every [`Sandbox`](crate::Sandbox). Engines resolve script calls through it
//! and never see the concrete binding types.

use bustrack_core::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::error::ScriptError;

/// A host function callable from script code.
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Exact argument count, or `None` for variadic.
    fn arity(&self) -> Option<usize> {
        None
    }

    /// Invoked on the blocking run thread.
    fn call(&self, args: Vec<Value>, cancel: &CancellationToken) -> Result<Value, ScriptError>;
}

type CapabilityFn = dyn Fn(Vec<Value>, &CancellationToken) -> Result<Value, ScriptError> + Send + Sync;

/// Closure-backed capability.
pub struct FnCapability {
    name: String,
    arity: Option<usize>,
    f: Box<CapabilityFn>,
}

impl FnCapability {
    pub fn new<F>(name: impl Into<String>, arity: Option<usize>, f: F) -> Self
    where
        F: Fn(Vec<Value>, &CancellationToken) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            f: Box::new(f),
        }
    }
}

impl Capability for FnCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        self.arity
    }

    fn call(&self, args: Vec<Value>, cancel: &CancellationToken) -> Result<Value, ScriptError> {
        (self.f)(args, cancel)
    }
}

/// Registered capabilities, keyed by script-visible name.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    entries: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a capability under its own name.
    pub fn register(&mut self, capability: impl Capability + 'static) -> &mut Self {
        self.entries
            .insert(capability.name().to_string(), Arc::new(capability));
        self
    }

    pub fn register_fn<F>(&mut self, name: &str, arity: Option<usize>, f: F) -> &mut Self
    where
        F: Fn(Vec<Value>, &CancellationToken) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        self.register(FnCapability::new(name, arity, f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `name`, check the argument count, and invoke it.
    pub fn call(&self, name: &str, args: Vec<Value>, cancel: &CancellationToken) -> Result<Value, ScriptError> {
        let capability = self
            .entries
            .get(name)
            .ok_or_else(|| ScriptError::UnresolvedReference(name.to_string()))?;
        if let Some(expected) = capability.arity() {
            if args.len() != expected {
                return Err(ScriptError::capability(
                    name,
                    format!("expected {expected} argument(s) but got {}", args.len()),
                ));
            }
        }
        if cancel.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        tracing::debug!(capability = name, args = args.len(), "capability call");
        capability.call(args, cancel)
    }
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// First argument as a string, or a capability error naming the position.
pub(crate) fn string_arg(name: &str, args: &[Value], index: usize) -> Result<String, ScriptError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ScriptError::capability(
            name,
            format!("argument {} must be a string, got {}", index + 1, other.type_name()),
        )),
        None => Err(ScriptError::capability(name, format!("missing argument {}", index + 1))),
    }
}
