//! `cognition.*` – vector similarity and embedding persistence.
//!
//! Meaning-space operations over packed-f32 embeddings: similarity, ranking,
//! and moving vectors in and out of the store. Vectors travel through
//! protocol memory as JSON number arrays and live in the database as packed
//! little-endian blobs.

use anyhow::Result;
use serde_json::{json, Value};

use strand_store::vector;
use strand_types::JsonMap;
use strand_vm::ExecutionContext;

use crate::args::{
    optional_i64, optional_str, require_array, require_context, require_f32_vec, require_str,
};

/// `cognition.vector.sim` – dot-product similarity of two vectors.
///
/// Assumes normalized vectors (so the dot product is the cosine).
pub async fn vector_sim(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let a = require_f32_vec(&args, "vector_a")?;
    let b = require_f32_vec(&args, "vector_b")?;
    if a.len() != b.len() {
        return Ok(json!({
            "status": "error",
            "error": format!("dimension mismatch: {} vs {}", a.len(), b.len()),
        }));
    }
    Ok(json!({"status": "success", "similarity": dot(&a, &b)}))
}

/// `cognition.vector.rank` – rank candidates by similarity to a query.
///
/// Candidates are `{id, vector}` maps; mismatched dimensions rank last with
/// similarity `null` rather than failing the whole batch.
pub async fn vector_rank(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let query = require_f32_vec(&args, "query")?;
    let candidates = require_array(&args, "candidates")?;
    let top_k = optional_i64(&args, "top_k").map(|k| k.max(0) as usize);

    let mut scored: Vec<(Option<f64>, Value)> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let id = candidate.get("id").cloned().unwrap_or(Value::Null);
        let similarity = candidate
            .get("vector")
            .and_then(Value::as_array)
            .and_then(|items| {
                let vec: Option<Vec<f32>> =
                    items.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
                vec
            })
            .filter(|vec| vec.len() == query.len())
            .map(|vec| dot(&query, &vec));
        scored.push((similarity, id));
    }

    scored.sort_by(|(a, _), (b, _)| {
        b.unwrap_or(f64::NEG_INFINITY)
            .partial_cmp(&a.unwrap_or(f64::NEG_INFINITY))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(k) = top_k {
        scored.truncate(k);
    }

    let ranked: Vec<Value> = scored
        .into_iter()
        .map(|(similarity, id)| json!({"id": id, "similarity": similarity}))
        .collect();
    let count = ranked.len();
    Ok(json!({"status": "success", "ranked": ranked, "count": count}))
}

/// `cognition.embed.store` – persist an entity's embedding vector.
pub async fn embed_store(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let entity_id = require_str(&args, "entity_id")?;
    let model = optional_str(&args, "model").unwrap_or_else(|| "default".to_string());
    let values = require_f32_vec(&args, "vector")?;

    let bytes = vector::encode(&values);
    match ctx
        .store
        .save_embedding(&entity_id, &model, &bytes, values.len() as i64)
        .await
    {
        Ok(()) => Ok(json!({
            "status": "success",
            "entity_id": entity_id,
            "dimension": values.len(),
        })),
        Err(err) => Ok(json!({"status": "error", "error": err.to_string()})),
    }
}

/// `cognition.embed.get` – fetch an entity's embedding as a number array.
pub async fn embed_get(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let entity_id = require_str(&args, "entity_id")?;

    match ctx.store.get_embedding(&entity_id).await? {
        Some(record) => {
            let values = vector::decode(&record.vector)?;
            Ok(json!({
                "status": "success",
                "found": true,
                "entity_id": record.entity_id,
                "model": record.model_name,
                "dimension": record.dimension,
                "vector": values,
            }))
        }
        None => Ok(json!({"status": "success", "found": false})),
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}
