//! `graph.*` – the core vocabulary for entity and bond operations.
//!
//! Everything in Strand is an entity in a graph connected by bonds; this
//! domain provides CRUD and queries over that structure. All handlers here
//! require the execution context (they touch storage).

use anyhow::Result;
use serde_json::{json, Value};
use uuid::Uuid;

use strand_types::JsonMap;
use strand_vm::ExecutionContext;

use crate::args::{
    optional_f64, optional_i64, optional_object, optional_str, require_context, require_str,
};

fn generated_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..8])
}

/// `graph.entity.get` – load a single entity by id.
pub async fn entity_get(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let id = require_str(&args, "id")?;

    match ctx.store.load_entity(&id).await? {
        Some(entity) => Ok(json!({
            "status": "success",
            "found": true,
            "entity": {"id": entity.id, "type": entity.entity_type, "data": entity.data},
        })),
        None => Ok(json!({"status": "success", "found": false, "entity": Value::Null})),
    }
}

/// `graph.entity.manifest` – create or update an entity.
///
/// Generates a `<type>-<hex>` id when none is supplied.
pub async fn entity_manifest(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let entity_type = require_str(&args, "type")?;
    let id = optional_str(&args, "id").unwrap_or_else(|| generated_id(&entity_type));
    let data = Value::Object(optional_object(&args, "data")?);

    ctx.store.save_entity(&id, &entity_type, &data).await?;
    Ok(json!({"status": "success", "id": id, "type": entity_type}))
}

/// `graph.entity.archive` – compost an entity (soft delete with provenance).
pub async fn entity_archive(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let id = require_str(&args, "id")?;
    let reason = optional_str(&args, "reason").unwrap_or_else(|| "composted".to_string());
    let archived_by = optional_str(&args, "archived_by").or(ctx.persona_id.clone());

    match ctx
        .store
        .archive_entity(&id, &reason, archived_by.as_deref(), None)
        .await?
    {
        Some(record) => Ok(json!({
            "status": "success",
            "found": true,
            "archive_id": record.id,
            "original_id": record.original_id,
        })),
        None => Ok(json!({"status": "success", "found": false})),
    }
}

/// `graph.query` – list entities of a type with optional field filters.
///
/// `filters` is a map of data-field → expected value (dot paths allowed).
pub async fn query(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let entity_type = require_str(&args, "type")?;
    let filters = optional_object(&args, "filters")?;
    let limit = optional_i64(&args, "limit").unwrap_or(i64::MAX);

    let mut items = Vec::new();
    for entity in ctx.store.list_entities_by_type(&entity_type).await? {
        let matches = filters.iter().all(|(field, expected)| {
            strand_vm::expr::values_eq(&dig(&entity.data, field), expected)
        });
        if matches {
            items.push(json!({"id": entity.id, "type": entity.entity_type, "data": entity.data}));
            if items.len() as i64 >= limit {
                break;
            }
        }
    }
    let count = items.len();
    Ok(json!({"status": "success", "items": items, "count": count}))
}

/// `graph.count` – entity counts grouped by type.
///
/// `types` optionally restricts the tally to the named type tags, so
/// orientation protocols can ignore infrastructure entities.
pub async fn count(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let wanted: Option<Vec<String>> = args.get("types").and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });

    let mut counts = JsonMap::new();
    for (entity_type, n) in ctx.store.count_entities_by_type().await? {
        if let Some(wanted) = &wanted {
            if !wanted.contains(&entity_type) {
                continue;
            }
        }
        counts.insert(entity_type, json!(n));
    }
    Ok(json!({"status": "success", "counts": counts}))
}

/// `graph.bond.manage` – create or update a bond between entities.
pub async fn bond_manage(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let bond_type = require_str(&args, "type")?;
    let from_id = require_str(&args, "from")?;
    let to_id = require_str(&args, "to")?;
    let id = optional_str(&args, "id").unwrap_or_else(|| generated_id("bond"));
    let status = optional_str(&args, "status").unwrap_or_else(|| "active".to_string());
    let confidence = optional_f64(&args, "confidence").unwrap_or(1.0);
    let data = Value::Object(optional_object(&args, "data")?);

    ctx.store
        .save_bond(&id, &bond_type, &from_id, &to_id, &status, confidence, &data)
        .await?;
    let stored = ctx.store.get_bond(&id).await?;
    Ok(json!({
        "status": "success",
        "id": id,
        "confidence": stored.map(|b| b.confidence).unwrap_or(confidence),
    }))
}

/// `graph.bond.list` – the constellation (outgoing + incoming) of an entity.
pub async fn bond_list(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let entity_id = require_str(&args, "id")?;
    let constellation = ctx.store.get_constellation(&entity_id).await?;
    Ok(json!({
        "status": "success",
        "entity_id": constellation.entity_id,
        "outgoing": constellation.outgoing,
        "incoming": constellation.incoming,
    }))
}

fn dig(value: &Value, path: &str) -> Value {
    let mut current = value.clone();
    for key in path.split('.') {
        current = match current {
            Value::Object(ref map) => match map.get(key) {
                Some(next) => next.clone(),
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strand_store::Store;
    use strand_vm::PrimitiveRegistry;

    async fn ctx() -> ExecutionContext {
        let store = Arc::new(Store::in_memory().await.unwrap());
        ExecutionContext::new(":memory:", store, Arc::new(PrimitiveRegistry::new()))
    }

    fn args(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn manifest_then_get_round_trips() {
        let ctx = ctx().await;
        let made = entity_manifest(
            args(json!({"type": "focus", "id": "focus-1",
                        "data": {"title": "F", "status": "active"}})),
            Some(ctx.clone()),
        )
        .await
        .unwrap();
        assert_eq!(made["id"], json!("focus-1"));

        let got = entity_get(args(json!({"id": "focus-1"})), Some(ctx)).await.unwrap();
        assert_eq!(got["found"], json!(true));
        assert_eq!(got["entity"]["data"]["status"], json!("active"));
    }

    #[tokio::test]
    async fn manifest_generates_typed_ids() {
        let ctx = ctx().await;
        let made = entity_manifest(args(json!({"type": "note", "data": {}})), Some(ctx))
            .await
            .unwrap();
        let id = made["id"].as_str().unwrap();
        assert!(id.starts_with("note-"));
    }

    #[tokio::test]
    async fn query_filters_on_data_fields() {
        let ctx = ctx().await;
        for (id, status) in [("f1", "active"), ("f2", "resolved"), ("f3", "active")] {
            ctx.store
                .save_entity(id, "focus", &json!({"status": status}))
                .await
                .unwrap();
        }

        let all = query(args(json!({"type": "focus"})), Some(ctx.clone())).await.unwrap();
        assert_eq!(all["count"], json!(3));

        let active = query(
            args(json!({"type": "focus", "filters": {"status": "active"}})),
            Some(ctx.clone()),
        )
        .await
        .unwrap();
        assert_eq!(active["count"], json!(2));

        let limited = query(
            args(json!({"type": "focus", "limit": 1})),
            Some(ctx),
        )
        .await
        .unwrap();
        assert_eq!(limited["count"], json!(1));
    }

    #[tokio::test]
    async fn count_groups_by_type() {
        let ctx = ctx().await;
        ctx.store.save_entity("f1", "focus", &json!({})).await.unwrap();
        ctx.store.save_entity("n1", "note", &json!({})).await.unwrap();
        ctx.store.save_entity("n2", "note", &json!({})).await.unwrap();

        let counted = count(JsonMap::new(), Some(ctx.clone())).await.unwrap();
        assert_eq!(counted["counts"]["focus"], json!(1));
        assert_eq!(counted["counts"]["note"], json!(2));

        let only_focus = count(args(json!({"types": ["focus"]})), Some(ctx)).await.unwrap();
        assert_eq!(only_focus["counts"], json!({"focus": 1}));
    }

    #[tokio::test]
    async fn bonds_manage_and_list() {
        let ctx = ctx().await;
        let made = bond_manage(
            args(json!({"type": "verifies", "from": "a", "to": "b", "confidence": 2.0})),
            Some(ctx.clone()),
        )
        .await
        .unwrap();
        assert_eq!(made["confidence"], json!(1.0));

        let listed = bond_list(args(json!({"id": "a"})), Some(ctx)).await.unwrap();
        assert_eq!(listed["outgoing"].as_array().unwrap().len(), 1);
        assert_eq!(listed["incoming"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn archive_reports_missing_entities() {
        let ctx = ctx().await;
        let missing = entity_archive(args(json!({"id": "ghost"})), Some(ctx.clone()))
            .await
            .unwrap();
        assert_eq!(missing["found"], json!(false));

        ctx.store.save_entity("e1", "note", &json!({})).await.unwrap();
        let archived = entity_archive(
            args(json!({"id": "e1", "reason": "stale"})),
            Some(ctx.clone()),
        )
        .await
        .unwrap();
        assert_eq!(archived["found"], json!(true));
        assert!(ctx.store.load_entity("e1").await.unwrap().is_none());
    }
}
