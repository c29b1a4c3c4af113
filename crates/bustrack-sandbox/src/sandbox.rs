//! The Sandbox contract: compile once, run once, against a fixed set of
//! environment bindings and capabilities.

use bustrack_core::Value;
use std::collections::BTreeMap;

use crate::cancel::CancellationToken;
use crate::capability::CapabilityTable;
use crate::error::ScriptError;

/// Turns source text into a runnable [`Program`].
pub trait ScriptEngine: Send + Sync {
    /// Short engine name for logs, e.g. `node`.
    fn name(&self) -> &str;

    /// Syntax-level checks happen here; failures are [`ScriptError::Compile`].
    fn compile(&self, code: &str) -> Result<Box<dyn Program>, ScriptError>;
}

/// A compiled script, ready to run.
pub trait Program: Send {
    /// Blocking. Must return promptly with [`ScriptError::Cancelled`] once
    /// `ctx.cancel` fires.
    fn run(&mut self, ctx: &RunContext<'_>) -> Result<Value, ScriptError>;
}

/// What a running program may see.
pub struct RunContext<'a> {
    /// Script-visible named string values.
    pub env: &'a BTreeMap<String, String>,
    pub capabilities: &'a CapabilityTable,
    pub cancel: &'a CancellationToken,
}

/// One isolated execution of a function's code.
pub struct Sandbox {
    program: Box<dyn Program>,
    env: BTreeMap<String, String>,
    capabilities: CapabilityTable,
    cancel: CancellationToken,
}

impl Sandbox {
    /// Compile `code`. Environment bindings must not shadow a capability name.
    pub fn new(
        engine: &dyn ScriptEngine,
        code: &str,
        env: BTreeMap<String, String>,
        capabilities: CapabilityTable,
    ) -> Result<Self, ScriptError> {
        if let Some(clash) = env.keys().find(|k| capabilities.contains(k)) {
            return Err(ScriptError::Compile(format!(
                "environment variable '{clash}' shadows a built-in function"
            )));
        }
        let program = engine.compile(code)?;
        Ok(Self {
            program,
            env,
            capabilities,
            cancel: CancellationToken::new(),
        })
    }

    /// Handle for aborting [`run`](Sandbox::run) from another thread.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Blocking run. Consumes the sandbox.
    pub fn run(mut self) -> Result<Value, ScriptError> {
        if self.cancel.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        let ctx = RunContext {
            env: &self.env,
            capabilities: &self.capabilities,
            cancel: &self.cancel,
        };
        let outcome = self.program.run(&ctx);
        match outcome {
            Err(_) if self.cancel.is_cancelled() => Err(ScriptError::Cancelled),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine whose "programs" are Rust closures.
    pub struct ClosureEngine<F>(pub F);

    struct ClosureProgram<F>(F);

    impl<F> Program for ClosureProgram<F>
    where
        F: Fn(&RunContext<'_>) -> Result<Value, ScriptError> + Send + Sync + Clone + 'static,
    {
        fn run(&mut self, ctx: &RunContext<'_>) -> Result<Value, ScriptError> {
            (self.0)(ctx)
        }
    }

    impl<F> ScriptEngine for ClosureEngine<F>
    where
        F: Fn(&RunContext<'_>) -> Result<Value, ScriptError> + Send + Sync + Clone + 'static,
    {
        fn name(&self) -> &str {
            "closure"
        }

        fn compile(&self, code: &str) -> Result<Box<dyn Program>, ScriptError> {
            if code.contains("syntax error") {
                return Err(ScriptError::Compile(code.to_string()));
            }
            Ok(Box::new(ClosureProgram(self.0.clone())))
        }
    }

    #[test]
    fn test_env_and_capabilities_visible() {
        let engine = ClosureEngine(|ctx: &RunContext<'_>| {
            let name = ctx.env.get("CITY").cloned().unwrap_or_default();
            ctx.capabilities.call("greet", vec![Value::from(name)], ctx.cancel)
        });
        let mut caps = CapabilityTable::new();
        caps.register_fn("greet", Some(1), |args, _| {
            Ok(Value::String(format!("hello {}", args[0].as_str().unwrap_or(""))))
        });
        let env = BTreeMap::from([("CITY".to_string(), "Seoul".to_string())]);

        let sandbox = Sandbox::new(&engine, "ok", env, caps).unwrap();
        assert_eq!(sandbox.run().unwrap(), Value::from("hello Seoul"));
    }

    #[test]
    fn test_compile_error_surfaces() {
        let engine = ClosureEngine(|_: &RunContext<'_>| Ok(Value::Null));
        let err = Sandbox::new(&engine, "syntax error here", BTreeMap::new(), CapabilityTable::new())
            .err()
            .unwrap();
        assert!(matches!(err, ScriptError::Compile(_)));
    }

    #[test]
    fn test_env_may_not_shadow_capability() {
        let engine = ClosureEngine(|_: &RunContext<'_>| Ok(Value::Null));
        let mut caps = CapabilityTable::new();
        caps.register_fn("get", Some(1), |_, _| Ok(Value::Null));
        let env = BTreeMap::from([("get".to_string(), "x".to_string())]);
        assert!(Sandbox::new(&engine, "", env, caps).is_err());
    }

    #[test]
    fn test_cancel_before_run() {
        let engine = ClosureEngine(|_: &RunContext<'_>| Ok(Value::Bool(true)));
        let sandbox = Sandbox::new(&engine, "", BTreeMap::new(), CapabilityTable::new()).unwrap();
        sandbox.cancel_token().cancel();
        assert!(matches!(sandbox.run(), Err(ScriptError::Cancelled)));
    }
}
