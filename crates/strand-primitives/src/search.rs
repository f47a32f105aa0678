//! `search.query` – full-text search over indexed entities.

use anyhow::Result;
use serde_json::{json, Value};

use strand_types::JsonMap;
use strand_vm::ExecutionContext;

use crate::args::{optional_i64, optional_str, require_context, require_str};

const DEFAULT_LIMIT: i64 = 10;

/// `search.query` – search indexed titles and bodies.
///
/// Backed by the FTS5 table when available, a LIKE scan otherwise; callers
/// see the same hit shape either way.
pub async fn query(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let text = require_str(&args, "query")?;
    let entity_type = optional_str(&args, "type");
    let limit = optional_i64(&args, "limit").unwrap_or(DEFAULT_LIMIT).max(1);

    let hits = ctx
        .store
        .search_entities(&text, entity_type.as_deref(), limit)
        .await?;
    let items: Vec<Value> = hits
        .into_iter()
        .map(|hit| json!({"id": hit.id, "type": hit.entity_type, "title": hit.title}))
        .collect();
    let count = items.len();
    Ok(json!({"status": "success", "hits": items, "count": count}))
}
