#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strand-primitives** – Built-in primitive library for Strand protocols.
//!
//! Primitives are small named callables composed by protocol graphs. Every
//! handler binds its arguments by name from a JSON map, optionally receives
//! the per-run [`ExecutionContext`], and returns a JSON value following the
//! `{status: "success"|"error", …}` data convention. The VM only fails on a
//! returned `Err`; `status` is how primitives talk to each other through
//! protocol memory.
//!
//! The domains:
//!
//! - `logic.*` – pure data manipulation (JSON paths, lists, string templates)
//! - `graph.*` – entity/bond CRUD and queries against the store
//! - `io.*` – the only domain allowed to touch the output sink
//! - `sys.*` – sandboxed subprocess execution, sub-protocol invocation
//!   through the registry hook, and failure injection
//! - `cognition.*` – vector similarity and embedding persistence
//! - `search.query` – full-text search over indexed entities
//!
//! [`resolve_handler`] is the symbol table mapping a stored `handler_ref`
//! to its callable; it is what the runner hands to the registry at
//! hydration time.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use strand_types::JsonMap;
use strand_vm::{ExecutionContext, PrimitiveFn, RegisteredHandler};

mod args;
pub mod cognition;
pub mod graph;
pub mod io;
pub mod logic;
pub mod search;
pub mod sys;

fn wrap<F, Fut>(handler: F) -> PrimitiveFn
where
    F: Fn(JsonMap, Option<ExecutionContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |args, ctx| Box::pin(handler(args, ctx)))
}

/// Resolve a `handler_ref` locator to its built-in handler.
///
/// Returns `None` for unknown refs; the registry keeps such records with
/// `handler: None` so they remain enumerable.
pub fn resolve_handler(handler_ref: &str) -> Option<RegisteredHandler> {
    let (func, accepts_context) = match handler_ref {
        // Pure data manipulation
        "logic.json.get" => (wrap(logic::json_get), false),
        "logic.json.set" => (wrap(logic::json_set), false),
        "logic.list.map" => (wrap(logic::list_map), false),
        "logic.list.filter" => (wrap(logic::list_filter), false),
        "logic.list.sort" => (wrap(logic::list_sort), false),
        "logic.string.format" => (wrap(logic::string_format), false),

        // Graph physics
        "graph.entity.get" => (wrap(graph::entity_get), true),
        "graph.entity.manifest" => (wrap(graph::entity_manifest), true),
        "graph.entity.archive" => (wrap(graph::entity_archive), true),
        "graph.query" => (wrap(graph::query), true),
        "graph.count" => (wrap(graph::count), true),
        "graph.bond.manage" => (wrap(graph::bond_manage), true),
        "graph.bond.list" => (wrap(graph::bond_list), true),

        // The membrane
        "io.ui.render" => (wrap(io::ui_render), true),
        "io.sys.log" => (wrap(io::sys_log), true),

        // Environment
        "sys.shell.run" => (wrap(sys::shell_run), true),
        "sys.protocol.run" => (wrap(sys::protocol_run), true),
        "sys.fail" => (wrap(sys::fail), false),

        // Semantic operations
        "cognition.vector.sim" => (wrap(cognition::vector_sim), false),
        "cognition.vector.rank" => (wrap(cognition::vector_rank), false),
        "cognition.embed.store" => (wrap(cognition::embed_store), true),
        "cognition.embed.get" => (wrap(cognition::embed_get), true),

        // Reflex surface
        "search.query" => (wrap(search::query), true),

        _ => return None,
    };
    Some(RegisteredHandler { func, accepts_context })
}

/// The resolver in the shape the registry expects.
pub fn resolver() -> strand_vm::HandlerResolver {
    Arc::new(resolve_handler)
}
