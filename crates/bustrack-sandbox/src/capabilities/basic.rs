//! Small helpers: `number(value)` and `sleep(millis)`.

use bustrack_core::Value;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::cancel::block_on_cancellable;
use crate::capability::CapabilityTable;
use crate::error::ScriptError;

/// Longest delay a script may request in one call.
const MAX_SLEEP: Duration = Duration::from_secs(600);

pub fn register(table: &mut CapabilityTable, handle: Handle) {
    table.register_fn("number", Some(1), |args, _| coerce_number(&args[0]).map(Value::Number));
    table.register_fn("sleep", Some(1), move |args, cancel| {
        let millis = coerce_number(&args[0])?;
        if millis < 0.0 {
            return Err(ScriptError::capability("sleep", "duration must not be negative"));
        }
        let duration = Duration::from_millis(millis as u64).min(MAX_SLEEP);
        block_on_cancellable(&handle, cancel, async {
            tokio::time::sleep(duration).await;
            Ok(Value::Null)
        })
    });
}

/// Numeric value of a scalar. Strings may carry thousands separators.
pub fn coerce_number(value: &Value) -> Result<f64, ScriptError> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| ScriptError::capability("number", format!("cannot convert '{s}' to a number")))
        }
        other => Err(ScriptError::capability(
            "number",
            format!("cannot convert {} to a number", other.type_name()),
        )),
    }
}
