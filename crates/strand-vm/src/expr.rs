//! Expression resolution over protocol memory.
//!
//! The expression language is deliberately tiny: a string beginning with
//! `$.` is a dot-split path into memory (numeric segments index into lists,
//! unresolved paths yield `null`), the form `{$.path}` interpolates resolved
//! values into text, and everything else passes through verbatim. Maps and
//! lists resolve recursively. No arithmetic, no conditionals.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use strand_types::{ConditionOp, EdgeCondition, JsonMap};

static INTERPOLATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{(\$\.[^}]+)\}").unwrap_or_else(|_| unreachable!("literal pattern"))
});

/// Resolve one expression value against memory.
///
/// The only failure mode is interpolating a composite value (list or map)
/// into a text template; there is no textual form for those.
pub fn resolve_value(pointer: &Value, memory: &JsonMap) -> Result<Value, String> {
    match pointer {
        Value::Object(map) => {
            let mut resolved = JsonMap::new();
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_value(value, memory)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_value(item, memory)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::String(text) => resolve_string(text, memory),
        other => Ok(other.clone()),
    }
}

fn resolve_string(text: &str, memory: &JsonMap) -> Result<Value, String> {
    if let Some(path) = text.strip_prefix("$.") {
        return Ok(resolve_path(path, memory));
    }

    if text.contains('{') && text.contains("$.") {
        let mut rendered = String::new();
        let mut last = 0;
        for capture in INTERPOLATION.captures_iter(text) {
            let whole = capture.get(0).ok_or("malformed interpolation")?;
            let expr = &capture[1];
            rendered.push_str(&text[last..whole.start()]);
            rendered.push_str(&render_scalar(&resolve_string(expr, memory)?, expr)?);
            last = whole.end();
        }
        rendered.push_str(&text[last..]);
        return Ok(Value::String(rendered));
    }

    Ok(Value::String(text.to_string()))
}

fn render_scalar(value: &Value, expr: &str) -> Result<String, String> {
    match value {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(_) | Value::Object(_) => {
            Err(format!("cannot interpolate composite value at {expr}"))
        }
    }
}

fn resolve_path(path: &str, memory: &JsonMap) -> Value {
    let mut current = Value::Object(memory.clone());
    for segment in path.split('.') {
        current = match current {
            Value::Object(ref map) => match map.get(segment) {
                Some(next) => next.clone(),
                None => return Value::Null,
            },
            Value::Array(ref items) => match segment.parse::<usize>() {
                Ok(index) if index < items.len() => items[index].clone(),
                _ => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current
}

/// Map a `{name → expression}` block against memory.
pub fn map_inputs(inputs: &JsonMap, memory: &JsonMap) -> Result<JsonMap, String> {
    let mut mapped = JsonMap::new();
    for (key, expression) in inputs {
        mapped.insert(key.clone(), resolve_value(expression, memory)?);
    }
    Ok(mapped)
}

//─────────────────────────────
//  Condition evaluation
//─────────────────────────────

/// Evaluate an edge condition against memory. Type mismatches are falsy.
pub fn eval_condition(condition: &EdgeCondition, memory: &JsonMap) -> bool {
    let actual = match resolve_value(&Value::String(condition.path.clone()), memory) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let expected = &condition.value;

    match condition.op {
        ConditionOp::Eq => values_eq(&actual, expected),
        ConditionOp::Neq => !values_eq(&actual, expected),
        ConditionOp::Gt => ordered(&actual, expected).map(|o| o.is_gt()).unwrap_or(false),
        ConditionOp::Lt => ordered(&actual, expected).map(|o| o.is_lt()).unwrap_or(false),
        ConditionOp::Empty => is_empty(&actual),
        ConditionOp::Contains => contains(&actual, expected),
    }
}

/// Equality with cross-representation numeric comparison (`1 == 1.0`).
pub fn values_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordered(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Some(x.cmp(y));
    }
    None
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => expected
            .as_str()
            .map(|needle| haystack.contains(needle))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| values_eq(item, expected)),
        Value::Object(map) => expected
            .as_str()
            .map(|key| map.contains_key(key))
            .unwrap_or(false),
        _ => false,
    }
}
