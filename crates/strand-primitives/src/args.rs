//! By-name argument binding helpers shared by the primitive handlers.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use strand_types::JsonMap;
use strand_vm::ExecutionContext;

pub(crate) fn require_str(args: &JsonMap, name: &str) -> Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => bail!("argument {name} must be a string, got {other}"),
        None => bail!("missing required argument: {name}"),
    }
}

pub(crate) fn optional_str(args: &JsonMap, name: &str) -> Option<String> {
    args.get(name).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn require_value(args: &JsonMap, name: &str) -> Result<Value> {
    args.get(name)
        .cloned()
        .with_context(|| format!("missing required argument: {name}"))
}

pub(crate) fn optional_value(args: &JsonMap, name: &str) -> Option<Value> {
    args.get(name).filter(|v| !v.is_null()).cloned()
}

pub(crate) fn require_array(args: &JsonMap, name: &str) -> Result<Vec<Value>> {
    match args.get(name) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => bail!("argument {name} must be a list, got {other}"),
        None => bail!("missing required argument: {name}"),
    }
}

pub(crate) fn optional_object(args: &JsonMap, name: &str) -> Result<JsonMap> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(JsonMap::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => bail!("argument {name} must be a map, got {other}"),
    }
}

pub(crate) fn optional_i64(args: &JsonMap, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

pub(crate) fn optional_f64(args: &JsonMap, name: &str) -> Option<f64> {
    args.get(name).and_then(Value::as_f64)
}

pub(crate) fn optional_bool(args: &JsonMap, name: &str) -> Option<bool> {
    args.get(name).and_then(Value::as_bool)
}

pub(crate) fn require_context(ctx: Option<ExecutionContext>) -> Result<ExecutionContext> {
    ctx.context("execution context required but not injected")
}

/// Decode a JSON number array into f32s.
pub(crate) fn require_f32_vec(args: &JsonMap, name: &str) -> Result<Vec<f32>> {
    let items = require_array(args, name)?;
    items
        .iter()
        .map(|item| {
            item.as_f64()
                .map(|f| f as f32)
                .with_context(|| format!("argument {name} must contain only numbers"))
        })
        .collect()
}
