//! `logic.*` – pure data transformation.
//!
//! These enable complex data flows within protocols without side effects:
//! dot-notation JSON access, list shaping, and string templating.

use anyhow::Result;
use serde_json::{json, Value};

use strand_types::JsonMap;
use strand_vm::ExecutionContext;

use crate::args::{optional_bool, optional_value, require_array, require_str, require_value};

/// `logic.json.get` – extract a value from nested JSON by dot-notation path.
///
/// Numeric segments index into lists. Returns the `default` (and
/// `found: false`) when the path does not resolve.
pub async fn json_get(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let data = require_value(&args, "data")?;
    let path = require_str(&args, "path")?;
    let default = args.get("default").cloned().unwrap_or(Value::Null);

    let mut current = data;
    for key in path.split('.') {
        current = match current {
            Value::Object(ref map) => match map.get(key) {
                Some(next) => next.clone(),
                None => return Ok(json!({"status": "success", "value": default, "found": false})),
            },
            Value::Array(ref items) => match key.parse::<usize>() {
                Ok(index) if index < items.len() => items[index].clone(),
                _ => return Ok(json!({"status": "success", "value": default, "found": false})),
            },
            _ => return Ok(json!({"status": "success", "value": default, "found": false})),
        };
    }
    Ok(json!({"status": "success", "value": current, "found": true}))
}

/// `logic.json.set` – set a value at a dot-notation path, immutably.
///
/// Creates intermediate maps as needed; setting through a non-map value is
/// reported as a data-level error.
pub async fn json_set(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let data = require_value(&args, "data")?;
    let path = require_str(&args, "path")?;
    let value = require_value(&args, "value")?;

    let mut result = data;
    let keys: Vec<&str> = path.split('.').collect();

    {
        let mut current = &mut result;
        for key in &keys[..keys.len().saturating_sub(1)] {
            let map = match current {
                Value::Object(map) => map,
                other => {
                    return Ok(json!({
                        "status": "error",
                        "message": format!("cannot descend into non-map value at {key}: {other}"),
                    }))
                }
            };
            current = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(JsonMap::new()));
        }
        match current {
            Value::Object(map) => {
                if let Some(last) = keys.last() {
                    map.insert(last.to_string(), value);
                }
            }
            other => {
                return Ok(json!({
                    "status": "error",
                    "message": format!("cannot set key on non-map value: {other}"),
                }))
            }
        }
    }

    Ok(json!({"status": "success", "data": result}))
}

/// `logic.list.map` – extract a field from each map in a list.
///
/// Supports dot-notation for nested extraction; unresolved fields map to
/// `null` so positions stay aligned with the input.
pub async fn list_map(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let items = require_array(&args, "items")?;
    let key = require_str(&args, "key")?;

    let values: Vec<Value> = items.iter().map(|item| dig(item, &key)).collect();
    let count = values.len();
    Ok(json!({"status": "success", "values": values, "count": count}))
}

/// `logic.list.filter` – keep items whose `field` equals `equals`.
pub async fn list_filter(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let items = require_array(&args, "items")?;
    let field = require_str(&args, "field")?;
    let expected = require_value(&args, "equals")?;

    let kept: Vec<Value> = items
        .into_iter()
        .filter(|item| strand_vm::expr::values_eq(&dig(item, &field), &expected))
        .collect();
    let count = kept.len();
    Ok(json!({"status": "success", "items": kept, "count": count}))
}

/// `logic.list.sort` – sort maps by a field (numbers before strings).
pub async fn list_sort(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let mut items = require_array(&args, "items")?;
    let field = require_str(&args, "field")?;
    let descending = optional_bool(&args, "descending").unwrap_or(false);

    items.sort_by(|a, b| {
        let ordering = compare(&dig(a, &field), &dig(b, &field));
        if descending { ordering.reverse() } else { ordering }
    });
    let count = items.len();
    Ok(json!({"status": "success", "items": items, "count": count}))
}

/// `logic.string.format` – substitute `{name}` placeholders from `values`.
///
/// Missing names render as the empty string; composite values are a
/// data-level error (no textual form).
pub async fn string_format(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let template = require_str(&args, "template")?;
    let values = match optional_value(&args, "values") {
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Ok(json!({
                "status": "error",
                "message": format!("values must be a map, got {other}"),
            }))
        }
        None => JsonMap::new(),
    };

    let mut text = String::new();
    let mut rest = template.as_str();
    while let Some(open) = rest.find('{') {
        text.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            text.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let name = &rest[open + 1..open + close];
        match values.get(name) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => text.push_str(s),
            Some(Value::Bool(b)) => text.push_str(&b.to_string()),
            Some(Value::Number(n)) => text.push_str(&n.to_string()),
            Some(other) => {
                return Ok(json!({
                    "status": "error",
                    "message": format!("cannot format composite value for {name}: {other}"),
                }))
            }
        }
        rest = &rest[open + close + 1..];
    }
    text.push_str(rest);

    Ok(json!({"status": "success", "text": text}))
}

fn dig(value: &Value, path: &str) -> Value {
    let mut current = value.clone();
    for key in path.split('.') {
        current = match current {
            Value::Object(ref map) => match map.get(key) {
                Some(next) => next.clone(),
                None => return Value::Null,
            },
            Value::Array(ref items) => match key.parse::<usize>() {
                Ok(index) if index < items.len() => items[index].clone(),
                _ => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}
