//! Protocol runner: shared execution machinery for every interface.
//!
//! One call stack per run. A CALL to a `protocol-*` ref suspends the current
//! state and pushes the freshly spawned child; when a child fulfills, its
//! extracted outputs resume the parent. The first STRESSED state anywhere on
//! the stack terminates the run with its structured error.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::warn;

use strand_store::{Store, StoreError};
use strand_types::{
    ErrorKind, EventOp, EventType, JsonMap, ProtocolData, ProtocolEntity, StateError, StateRecord,
    StateStatus,
};
use strand_vm::{
    ExecutionContext, OutputSink, PrimitiveRegistry, ProtocolLoader, ProtocolVm,
};

/// Maximum protocol recursion depth before the run fails with
/// `protocol_error` instead of overflowing.
pub const DEFAULT_MAX_DEPTH: usize = 64;

fn storage_error(err: StoreError) -> StateError {
    StateError::new(ErrorKind::StorageError, err.to_string())
}

/// Load every `primitive` entity into the registry.
///
/// Unresolvable handler refs register with `handler: None` and stay
/// enumerable; malformed records are skipped with a warning.
pub async fn hydrate_primitives(
    store: &Store,
    registry: &PrimitiveRegistry,
    resolver: &strand_vm::HandlerResolver,
) -> Result<usize, StateError> {
    let mut registered = 0;
    for entity in store
        .list_entities_by_type("primitive")
        .await
        .map_err(storage_error)?
    {
        let entity_id = entity.id.clone();
        let wire = json!({"id": entity.id, "data": entity.data});
        match serde_json::from_value::<strand_types::PrimitiveEntity>(wire) {
            Ok(primitive) => {
                registry.register_from_entity(primitive, resolver);
                registered += 1;
            }
            Err(err) => {
                warn!(entity_id = %entity_id, error = %err, "skipping malformed primitive entity");
            }
        }
    }
    Ok(registered)
}

/// Load a protocol entity by id. `None` when absent or not a protocol.
///
/// A row that exists but does not parse is a `protocol_error` (corrupt
/// graph), not a missing protocol.
pub async fn load_protocol(
    store: &Store,
    protocol_id: &str,
) -> Result<Option<ProtocolEntity>, StateError> {
    let Some(entity) = store.load_entity(protocol_id).await.map_err(storage_error)? else {
        return Ok(None);
    };
    if entity.entity_type != "protocol" {
        return Ok(None);
    }
    let data: ProtocolData = serde_json::from_value(entity.data).map_err(|err| {
        StateError::new(
            ErrorKind::ProtocolError,
            format!("corrupt protocol graph for {protocol_id}: {err}"),
        )
    })?;
    Ok(Some(ProtocolEntity { id: entity.id, version: 1, data }))
}

/// Execute a protocol to completion against the database at `db_path`.
///
/// Returns the outputs of the RETURN node that terminated the run, or the
/// structured error of the first STRESSED state.
pub async fn execute_protocol(
    db_path: &str,
    protocol_id: &str,
    inputs: JsonMap,
    persona_id: Option<&str>,
    state_id: Option<&str>,
    output_sink: Option<OutputSink>,
) -> Result<JsonMap, StateError> {
    execute_boxed(
        db_path.to_string(),
        protocol_id.to_string(),
        inputs,
        persona_id.map(str::to_string),
        state_id.map(str::to_string),
        output_sink,
        0,
    )
    .await
}

// Owned-argument form so the nested-invoker hook can recurse through a
// boxed future.
fn execute_boxed(
    db_path: String,
    protocol_id: String,
    inputs: JsonMap,
    persona_id: Option<String>,
    state_id: Option<String>,
    output_sink: Option<OutputSink>,
    depth: usize,
) -> BoxFuture<'static, Result<JsonMap, StateError>> {
    Box::pin(async move {
        if !Path::new(&db_path).exists() {
            return Err(StateError::new(
                ErrorKind::DatabaseNotFound,
                format!("database not found: {db_path}"),
            ));
        }
        let store = Arc::new(Store::open(&db_path).await.map_err(storage_error)?);

        let registry = Arc::new(PrimitiveRegistry::new());
        if let Err(err) = hydrate_primitives(&store, &registry, &strand_primitives::resolver()).await
        {
            store.close().await;
            return Err(err);
        }

        let protocol = match load_protocol(&store, &protocol_id).await {
            Ok(Some(protocol)) => protocol,
            Ok(None) => {
                store.close().await;
                return Err(StateError::new(
                    ErrorKind::ProtocolNotFound,
                    format!("protocol not found: {protocol_id}"),
                ));
            }
            Err(err) => {
                store.close().await;
                return Err(err);
            }
        };

        // Nested-invoker hook: primitives recurse into the runner without a
        // compile-time dependency on it. Failures come back at the data
        // level so the calling protocol can branch on them.
        {
            let db_path = db_path.clone();
            let persona_id = persona_id.clone();
            let output_sink = output_sink.clone();
            let child_depth = depth + 1;
            registry.set_protocol_invoker(Arc::new(move |pid, pinputs| {
                let db_path = db_path.clone();
                let persona_id = persona_id.clone();
                let output_sink = output_sink.clone();
                Box::pin(async move {
                    let outcome = execute_boxed(
                        db_path,
                        pid,
                        pinputs,
                        persona_id,
                        None,
                        output_sink,
                        child_depth,
                    )
                    .await;
                    Ok(outcome.unwrap_or_else(|err| error_outputs(&err)))
                })
            }));
        }

        // Callers see db_path and persona through the reserved inputs key.
        let mut full_inputs = JsonMap::new();
        full_inputs.insert("db_path".to_string(), json!(db_path));
        for (key, value) in inputs {
            full_inputs.insert(key, value);
        }
        if let Some(persona) = &persona_id {
            full_inputs.insert("persona_id".to_string(), json!(persona));
        }

        let result = run_protocol(
            Arc::clone(&store),
            registry,
            protocol,
            full_inputs,
            state_id,
            persona_id,
            output_sink,
            depth,
        )
        .await;

        store.close().await;
        result
    })
}

fn error_outputs(err: &StateError) -> JsonMap {
    let mut outputs = JsonMap::new();
    outputs.insert("status".to_string(), json!("error"));
    outputs.insert("error_kind".to_string(), json!(err.kind.as_str()));
    outputs.insert("error_message".to_string(), json!(&err.message));
    outputs
}

#[allow(clippy::too_many_arguments)]
async fn run_protocol(
    store: Arc<Store>,
    registry: Arc<PrimitiveRegistry>,
    protocol: ProtocolEntity,
    inputs: JsonMap,
    state_id: Option<String>,
    persona_id: Option<String>,
    output_sink: Option<OutputSink>,
    depth: usize,
) -> Result<JsonMap, StateError> {
    let loader: ProtocolLoader = {
        let store = Arc::clone(&store);
        Arc::new(move |pid| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                load_protocol(&store, &pid).await.map_err(anyhow::Error::new)
            })
        })
    };

    let context = ExecutionContext::new(store.path(), Arc::clone(&store), Arc::clone(&registry))
        .with_persona(persona_id.clone())
        .with_state(state_id.clone())
        .with_sink(output_sink);
    let vm = ProtocolVm::new(registry).with_loader(loader).with_context(context);

    let mut root = vm.spawn(&protocol, inputs);
    if let Some(id) = state_id {
        root.id = id;
    }
    root.status = StateStatus::Running;
    let root_id = root.id.clone();
    let root_protocol = Arc::new(protocol);

    if let Err(err) = store
        .emit_event(
            EventType::ProtocolSpawn,
            EventOp::Success,
            persona_id.as_deref(),
            json!({ "protocol_id": &root_protocol.id, "state_id": &root_id }),
        )
        .await
    {
        warn!(error = %err, "failed to record protocol_spawn event");
    }

    let mut stack: Vec<(Arc<ProtocolEntity>, StateRecord)> = vec![(Arc::clone(&root_protocol), root)];

    loop {
        let Some((current_protocol, current_state)) = stack.pop() else {
            // The stack only drains by returning below.
            return Err(StateError::new(ErrorKind::RuntimeError, "runner stack drained"));
        };

        match current_state.status {
            StateStatus::Fulfilled => {
                if let Some((parent_protocol, parent_state)) = stack.pop() {
                    let result = vm.extract_output(&current_protocol, &current_state);
                    let (resumed, _) = vm.step(&parent_protocol, parent_state, Some(result)).await;
                    stack.push((parent_protocol, resumed));
                } else {
                    let outputs = vm.extract_output(&current_protocol, &current_state);
                    finish(&store, &current_state, persona_id.as_deref(), None).await;
                    return Ok(outputs);
                }
            }
            StateStatus::Stressed => {
                let error = current_state
                    .data
                    .error
                    .clone()
                    .unwrap_or_else(|| StateError::new(ErrorKind::RuntimeError, "unknown error"));
                let root_state = root_terminal(&stack, current_state, &error);
                finish(&store, &root_state, persona_id.as_deref(), Some(&error)).await;
                return Err(error);
            }
            _ => {
                let (updated, child) = vm.step(&current_protocol, current_state, None).await;
                stack.push((current_protocol, updated));

                if let Some(mut child) = child {
                    if depth + stack.len() >= DEFAULT_MAX_DEPTH {
                        let error = StateError::new(
                            ErrorKind::ProtocolError,
                            format!("protocol recursion exceeded depth {DEFAULT_MAX_DEPTH}"),
                        );
                        let root_state = root_terminal(&stack, stack[0].1.clone(), &error);
                        finish(&store, &root_state, persona_id.as_deref(), Some(&error)).await;
                        return Err(error);
                    }
                    match load_protocol(&store, &child.data.protocol_id).await {
                        Ok(Some(child_protocol)) => {
                            child.status = StateStatus::Running;
                            stack.push((Arc::new(child_protocol), child));
                        }
                        Ok(None) => {
                            let error = StateError::new(
                                ErrorKind::ProtocolError,
                                format!("protocol not found: {}", child.data.protocol_id),
                            );
                            let root_state = root_terminal(&stack, child, &error);
                            finish(&store, &root_state, persona_id.as_deref(), Some(&error)).await;
                            return Err(error);
                        }
                        Err(error) => {
                            let root_state = root_terminal(&stack, child, &error);
                            finish(&store, &root_state, persona_id.as_deref(), Some(&error)).await;
                            return Err(error);
                        }
                    }
                }
            }
        }
    }
}

/// The snapshot persisted for the run as a whole: the terminal state when it
/// is the root, otherwise the root marked stressed with the propagated error.
fn root_terminal(
    stack: &[(Arc<ProtocolEntity>, StateRecord)],
    terminal: StateRecord,
    error: &StateError,
) -> StateRecord {
    match stack.first() {
        None => terminal,
        Some((_, root)) => {
            let mut root = root.clone();
            root.status = StateStatus::Stressed;
            root.data.error = Some(error.clone());
            root
        }
    }
}

async fn finish(
    store: &Store,
    root_state: &StateRecord,
    persona_id: Option<&str>,
    error: Option<&StateError>,
) {
    if let Err(err) = store.save_state(root_state).await {
        warn!(error = %err, state_id = %root_state.id, "failed to persist terminal state");
    }
    let (op, payload) = match error {
        None => (
            EventOp::Success,
            json!({
                "state_id": &root_state.id,
                "protocol_id": &root_state.data.protocol_id,
                "exit_node": &root_state.data.exit_node,
            }),
        ),
        Some(error) => (
            EventOp::Error,
            json!({
                "state_id": &root_state.id,
                "protocol_id": &root_state.data.protocol_id,
                "error_kind": error.kind.as_str(),
                "error_message": &error.message,
            }),
        ),
    };
    if let Err(err) = store
        .emit_event(EventType::ProtocolStep, op, persona_id, payload)
        .await
    {
        warn!(error = %err, "failed to record protocol_step event");
    }
}
