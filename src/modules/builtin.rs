//! Built-in modules available under `std/` relative to the base directory.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::ThrownError;
use crate::modules::{ExportTable, ModuleRegistry, param};

/// Upper bound for `std/math.sleep`.
const MAX_SLEEP_MS: u64 = 60_000;

/// Register `std/math` and `std/text` as protected modules.
pub fn register(registry: &ModuleRegistry) {
    registry.register_builtin("std/math", Arc::new(math()));
    registry.register_builtin("std/text", Arc::new(text()));
}

/// Arithmetic on numbers, plus an async `sleep(ms)` that returns `ms`.
pub fn math() -> ExportTable {
    ExportTable::new()
        .function("add", |args| binary(&args, |a, b| Ok(a + b)))
        .function("subtract", |args| binary(&args, |a, b| Ok(a - b)))
        .function("multiply", |args| binary(&args, |a, b| Ok(a * b)))
        .function("divide", |args| {
            binary(&args, |a, b| {
                if b == 0.0 {
                    return Err(ThrownError::new("RangeError", "division by zero").into());
                }
                Ok(a / b)
            })
        })
        .function("sum", |args| {
            let values: Vec<f64> = param(&args, 0)?;
            number(values.iter().sum())
        })
        .async_function("sleep", |args| async move {
            let ms: u64 = param(&args, 0)?;
            if ms > MAX_SLEEP_MS {
                return Err(ThrownError::new(
                    "RangeError",
                    format!("sleep of {ms}ms exceeds {MAX_SLEEP_MS}ms"),
                )
                .into());
            }
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, anyhow::Error>(json!(ms))
        })
        .constant("PI", json!(std::f64::consts::PI))
}

/// String helpers.
pub fn text() -> ExportTable {
    ExportTable::new()
        .function("upper", |args| {
            let s: String = param(&args, 0)?;
            Ok(json!(s.to_uppercase()))
        })
        .function("lower", |args| {
            let s: String = param(&args, 0)?;
            Ok(json!(s.to_lowercase()))
        })
        .function("length", |args| {
            let s: String = param(&args, 0)?;
            Ok(json!(s.chars().count()))
        })
        .function("concat", |args| {
            let joined: String = args
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Ok(json!(joined))
        })
        .function("split", |args| {
            let s: String = param(&args, 0)?;
            let separator: String = param(&args, 1)?;
            Ok(json!(s.split(separator.as_str()).collect::<Vec<_>>()))
        })
}

fn binary(
    args: &[Value],
    op: impl FnOnce(f64, f64) -> anyhow::Result<f64>,
) -> anyhow::Result<Value> {
    let a: f64 = param(args, 0)?;
    let b: f64 = param(args, 1)?;
    number(op(a, b)?)
}

/// A JSON number, or a `RangeError` for results JSON cannot carry.
fn number(value: f64) -> anyhow::Result<Value> {
    if !value.is_finite() {
        let message = format!("result {value} is not a finite number");
        return Err(ThrownError::new("RangeError", message).into());
    }
    Ok(json!(value))
}
