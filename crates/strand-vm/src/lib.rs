#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strand-vm** – The step interpreter at the center of Strand.
//!
//! A protocol is a directed graph of CALL and RETURN nodes. The VM advances
//! one state one node at a time: CALL nodes bind their inputs against the
//! run's memory and invoke a primitive (or suspend into a sub-protocol),
//! RETURN nodes terminate the run and record the exit node. Edges are taken
//! in a fixed precedence: matching conditional first, then the default, then
//! a plain unconditional edge; a node with no viable successor fulfills the
//! run without an exit node.
//!
//! The VM is single-threaded and cooperative within one run. A CALL to a
//! `protocol-*` ref is the only suspension point; primitive calls are
//! awaited inline. Handler failures never escape as panics or errors: they
//! become STRESSED states carrying a structured `{kind, message}`.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use strand_types::{
    ErrorKind, JsonMap, NodeKind, ProtocolEntity, ProtocolGraph, StateData, StateError,
    StateRecord, StateStatus, PROTOCOL_PREFIX,
};

pub mod context;
pub mod expr;
pub mod registry;

pub use context::{ExecutionContext, OutputSink};
pub use registry::{
    HandlerResolver, PrimitiveFn, PrimitiveRecord, PrimitiveRegistry, ProtocolInvoker,
    RegisteredHandler, RegistryError,
};

/// Resolves a `protocol-*` ref to its entity, or `None` when absent.
pub type ProtocolLoader =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Option<ProtocolEntity>>> + Send + Sync>;

//─────────────────────────────
//  The virtual machine
//─────────────────────────────

/// Single-step interpreter over protocol graphs.
pub struct ProtocolVm {
    registry: Arc<PrimitiveRegistry>,
    loader: Option<ProtocolLoader>,
    context: Option<ExecutionContext>,
}

impl ProtocolVm {
    /// Build a VM over a hydrated registry.
    pub fn new(registry: Arc<PrimitiveRegistry>) -> Self {
        Self { registry, loader: None, context: None }
    }

    /// Attach a protocol loader; required for sub-protocol CALLs.
    pub fn with_loader(mut self, loader: ProtocolLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Attach the execution context injected into context-aware handlers.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Create a fresh PENDING state for one run of `protocol`.
    ///
    /// Memory starts with the reserved `"inputs"` key; the cursor sits on
    /// the graph's start node.
    pub fn spawn(&self, protocol: &ProtocolEntity, inputs: JsonMap) -> StateRecord {
        let mut memory = JsonMap::new();
        memory.insert("inputs".to_string(), Value::Object(inputs));
        StateRecord {
            id: format!("state-{}", Uuid::new_v4()),
            status: StateStatus::Pending,
            data: StateData {
                protocol_id: protocol.id.clone(),
                protocol_version: protocol.version,
                parent_state_id: None,
                cursor: Some(protocol.data.graph.start.clone()),
                exit_node: None,
                memory,
                error: None,
            },
        }
    }

    /// Assemble a run's outputs from its recorded exit node.
    ///
    /// Falls back to the first RETURN node in the graph for snapshots that
    /// predate exit-node recording; returns an empty map when the graph has
    /// no RETURN at all.
    pub fn extract_output(&self, protocol: &ProtocolEntity, state: &StateRecord) -> JsonMap {
        let graph = &protocol.data.graph;

        if let Some(exit_node) = &state.data.exit_node {
            if let Some(node) = graph.nodes.get(exit_node) {
                if node.kind == NodeKind::Return {
                    return self.map_or_empty(&node.outputs, &state.data.memory);
                }
            }
        }

        for node in graph.nodes.values() {
            if node.kind == NodeKind::Return {
                return self.map_or_empty(&node.outputs, &state.data.memory);
            }
        }
        JsonMap::new()
    }

    fn map_or_empty(&self, outputs: &JsonMap, memory: &JsonMap) -> JsonMap {
        match expr::map_inputs(outputs, memory) {
            Ok(mapped) => mapped,
            Err(reason) => {
                warn!(%reason, "output mapping failed; returning empty outputs");
                JsonMap::new()
            }
        }
    }

    /// Execute one step of `protocol` against `state`.
    ///
    /// Returns the updated state and, when a sub-protocol CALL suspended the
    /// run, a freshly spawned child state the caller must drive to
    /// fulfillment before resuming the parent with the child's outputs.
    pub async fn step(
        &self,
        protocol: &ProtocolEntity,
        mut state: StateRecord,
        child_result: Option<JsonMap>,
    ) -> (StateRecord, Option<StateRecord>) {
        let graph = &protocol.data.graph;

        // Resumption: store the child's result under the suspended node.
        if state.status == StateStatus::Suspended {
            if let Some(result) = child_result {
                if let Some(cursor) = state.data.cursor.clone() {
                    state.data.memory.insert(cursor.clone(), Value::Object(result));
                    return (advance_cursor(graph, state, &cursor), None);
                }
            }
            return (state, None);
        }

        if !matches!(state.status, StateStatus::Pending | StateStatus::Running) {
            return (state, None);
        }

        let Some(cursor) = state.data.cursor.clone() else {
            state.status = StateStatus::Fulfilled;
            return (state, None);
        };
        let Some(node) = graph.nodes.get(&cursor) else {
            state.status = StateStatus::Fulfilled;
            state.data.cursor = None;
            return (state, None);
        };

        match node.kind {
            NodeKind::Call => {
                let Some(node_ref) = node.node_ref.clone() else {
                    return (
                        stress(state, ErrorKind::ConfigError, format!("node {cursor} missing ref")),
                        None,
                    );
                };

                // Protocol refs are more specific; try them first.
                if node_ref.starts_with(PROTOCOL_PREFIX) {
                    return self.step_protocol_call(protocol, state, &cursor, &node_ref).await;
                }

                let record = match self.registry.get(&node_ref) {
                    Ok(record) => record,
                    Err(_) => {
                        return (
                            stress(
                                state,
                                ErrorKind::PrimitiveNotFound,
                                format!("primitive {node_ref} not found"),
                            ),
                            None,
                        );
                    }
                };
                let Some(handler) = record.handler.clone() else {
                    return (
                        stress(
                            state,
                            ErrorKind::PrimitiveNotLoaded,
                            format!("handler for {node_ref} could not be loaded"),
                        ),
                        None,
                    );
                };

                let kwargs = match expr::map_inputs(&node.inputs, &state.data.memory) {
                    Ok(kwargs) => kwargs,
                    Err(reason) => return (stress(state, ErrorKind::MappingError, reason), None),
                };
                let context = if handler.accepts_context { self.context.clone() } else { None };

                match (handler.func)(kwargs, context).await {
                    Ok(result) => {
                        state.data.memory.insert(cursor.clone(), result);
                        (advance_cursor(graph, state, &cursor), None)
                    }
                    Err(err) => {
                        (stress(state, ErrorKind::RuntimeError, err.to_string()), None)
                    }
                }
            }
            NodeKind::Return => {
                state.status = StateStatus::Fulfilled;
                state.data.exit_node = Some(cursor);
                state.data.cursor = None;
                (state, None)
            }
        }
    }

    async fn step_protocol_call(
        &self,
        protocol: &ProtocolEntity,
        mut state: StateRecord,
        cursor: &str,
        node_ref: &str,
    ) -> (StateRecord, Option<StateRecord>) {
        let Some(loader) = self.loader.clone() else {
            return (
                stress(state, ErrorKind::ConfigError, "no protocol loader configured"),
                None,
            );
        };

        let child_protocol = match loader(node_ref.to_string()).await {
            Ok(Some(child)) => child,
            Ok(None) => {
                return (
                    stress(
                        state,
                        ErrorKind::ProtocolError,
                        format!("protocol {node_ref} not found"),
                    ),
                    None,
                );
            }
            Err(err) => return (stress(state, ErrorKind::ProtocolError, err.to_string()), None),
        };

        let node_inputs = protocol
            .data
            .graph
            .nodes
            .get(cursor)
            .map(|node| node.inputs.clone())
            .unwrap_or_default();
        let child_inputs = match expr::map_inputs(&node_inputs, &state.data.memory) {
            Ok(inputs) => inputs,
            Err(reason) => return (stress(state, ErrorKind::MappingError, reason), None),
        };

        let mut child = self.spawn(&child_protocol, child_inputs);
        child.data.parent_state_id = Some(state.id.clone());
        state.status = StateStatus::Suspended;
        (state, Some(child))
    }
}

fn stress(mut state: StateRecord, kind: ErrorKind, message: impl Into<String>) -> StateRecord {
    state.status = StateStatus::Stressed;
    state.data.error = Some(StateError::new(kind, message));
    state
}

/// Pick the next cursor from `current_node_id` per edge precedence:
/// matching conditional, then default, then plain unconditional. With no
/// viable successor the run fulfills without recording an exit node.
fn advance_cursor(graph: &ProtocolGraph, mut state: StateRecord, current_node_id: &str) -> StateRecord {
    let candidates: Vec<_> = graph
        .edges
        .iter()
        .filter(|edge| edge.from_node == current_node_id)
        .collect();

    for edge in &candidates {
        if let Some(condition) = &edge.condition {
            if expr::eval_condition(condition, &state.data.memory) {
                state.data.cursor = Some(edge.to_node.clone());
                state.status = StateStatus::Running;
                return state;
            }
        }
    }

    if let Some(edge) = candidates.iter().find(|edge| edge.default && edge.condition.is_none()) {
        state.data.cursor = Some(edge.to_node.clone());
        state.status = StateStatus::Running;
        return state;
    }

    if let Some(edge) = candidates.iter().find(|edge| !edge.default && edge.condition.is_none()) {
        state.data.cursor = Some(edge.to_node.clone());
        state.status = StateStatus::Running;
        return state;
    }

    state.status = StateStatus::Fulfilled;
    state.data.cursor = None;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_types::{PrimitiveData, PrimitiveEntity};

    fn protocol(id: &str, graph: Value) -> ProtocolEntity {
        serde_json::from_value(json!({
            "id": id,
            "data": {"interface": {}, "graph": graph}
        }))
        .unwrap()
    }

    fn test_resolver() -> HandlerResolver {
        Arc::new(|handler_ref| {
            let func: PrimitiveFn = match handler_ref {
                "test.echo" => Arc::new(|args, _ctx| {
                    Box::pin(async move { Ok(Value::Object(args)) })
                }),
                "test.fail" => Arc::new(|args, _ctx| {
                    Box::pin(async move {
                        let message = args
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("failed")
                            .to_string();
                        Err(anyhow::anyhow!(message))
                    })
                }),
                _ => return None,
            };
            Some(RegisteredHandler { func, accepts_context: false })
        })
    }

    fn registry_with(ids: &[(&str, &str)]) -> Arc<PrimitiveRegistry> {
        let registry = Arc::new(PrimitiveRegistry::new());
        let resolver = test_resolver();
        for (id, handler_ref) in ids {
            registry.register_from_entity(
                PrimitiveEntity {
                    id: id.to_string(),
                    data: PrimitiveData {
                        handler_ref: handler_ref.to_string(),
                        description: None,
                        interface: json!({}),
                    },
                },
                &resolver,
            );
        }
        registry
    }

    async fn run(vm: &ProtocolVm, protocol: &ProtocolEntity, inputs: Value) -> (StateRecord, JsonMap) {
        let inputs = match inputs {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        let mut state = vm.spawn(protocol, inputs);
        state.status = StateStatus::Running;
        loop {
            match state.status {
                StateStatus::Fulfilled => {
                    let output = vm.extract_output(protocol, &state);
                    return (state, output);
                }
                StateStatus::Stressed => return (state, JsonMap::new()),
                _ => {
                    let (updated, child) = vm.step(protocol, state, None).await;
                    assert!(child.is_none(), "nested protocols need the runner's stack");
                    state = updated;
                }
            }
        }
    }

    #[tokio::test]
    async fn linear_call_records_result_and_exit_node() {
        let registry = registry_with(&[("primitive-echo", "test.echo")]);
        let vm = ProtocolVm::new(registry);
        let proto = protocol(
            "protocol-linear",
            json!({
                "start": "say",
                "nodes": {
                    "say": {"kind": "call", "ref": "primitive-echo",
                            "inputs": {"word": "$.inputs.word"}},
                    "done": {"kind": "return", "outputs": {"echoed": "$.say.word"}}
                },
                "edges": [{"from": "say", "to": "done"}]
            }),
        );

        let (state, output) = run(&vm, &proto, json!({"word": "hum"})).await;
        assert_eq!(state.status, StateStatus::Fulfilled);
        assert_eq!(state.data.exit_node.as_deref(), Some("done"));
        assert_eq!(state.data.cursor, None);
        assert_eq!(output["echoed"], json!("hum"));
        assert_eq!(state.data.memory["say"], json!({"word": "hum"}));
    }

    #[tokio::test]
    async fn matching_condition_beats_default_regardless_of_order() {
        let registry = registry_with(&[("primitive-echo", "test.echo")]);
        let vm = ProtocolVm::new(registry);
        // The default edge is declared before the conditional one.
        let proto = protocol(
            "protocol-branch",
            json!({
                "start": "check",
                "nodes": {
                    "check": {"kind": "call", "ref": "primitive-echo",
                              "inputs": {"found": false}},
                    "r_ok": {"kind": "return", "outputs": {"ok": true}},
                    "r_err": {"kind": "return", "outputs": {"error": "nf"}}
                },
                "edges": [
                    {"from": "check", "to": "r_ok", "default": true},
                    {"from": "check", "to": "r_err",
                     "condition": {"op": "eq", "path": "$.check.found", "value": false}}
                ]
            }),
        );

        let (state, output) = run(&vm, &proto, json!({})).await;
        assert_eq!(state.data.exit_node.as_deref(), Some("r_err"));
        assert_eq!(output["error"], json!("nf"));
    }

    #[tokio::test]
    async fn default_edge_taken_when_no_condition_matches() {
        let registry = registry_with(&[("primitive-echo", "test.echo")]);
        let vm = ProtocolVm::new(registry);
        let proto = protocol(
            "protocol-branch",
            json!({
                "start": "check",
                "nodes": {
                    "check": {"kind": "call", "ref": "primitive-echo",
                              "inputs": {"found": true}},
                    "r_ok": {"kind": "return", "outputs": {"ok": true}},
                    "r_err": {"kind": "return", "outputs": {"error": "nf"}}
                },
                "edges": [
                    {"from": "check", "to": "r_err",
                     "condition": {"op": "eq", "path": "$.check.found", "value": false}},
                    {"from": "check", "to": "r_ok", "default": true}
                ]
            }),
        );

        let (state, output) = run(&vm, &proto, json!({})).await;
        assert_eq!(state.data.exit_node.as_deref(), Some("r_ok"));
        assert_eq!(output["ok"], json!(true));
    }

    #[tokio::test]
    async fn dead_end_fulfills_without_exit_node() {
        let registry = registry_with(&[("primitive-echo", "test.echo")]);
        let vm = ProtocolVm::new(registry);
        let proto = protocol(
            "protocol-dead-end",
            json!({
                "start": "only",
                "nodes": {
                    "only": {"kind": "call", "ref": "primitive-echo", "inputs": {}}
                },
                "edges": []
            }),
        );

        let (state, output) = run(&vm, &proto, json!({})).await;
        assert_eq!(state.status, StateStatus::Fulfilled);
        assert_eq!(state.data.exit_node, None);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn handler_failure_becomes_runtime_error() {
        let registry = registry_with(&[("primitive-fail", "test.fail")]);
        let vm = ProtocolVm::new(registry);
        let proto = protocol(
            "protocol-boom",
            json!({
                "start": "blow",
                "nodes": {
                    "blow": {"kind": "call", "ref": "primitive-fail",
                             "inputs": {"message": "boom"}},
                    "done": {"kind": "return", "outputs": {}}
                },
                "edges": [{"from": "blow", "to": "done"}]
            }),
        );

        let (state, _) = run(&vm, &proto, json!({})).await;
        assert_eq!(state.status, StateStatus::Stressed);
        let error = state.data.error.unwrap();
        assert_eq!(error.kind, ErrorKind::RuntimeError);
        assert_eq!(error.message, "boom");
    }

    #[tokio::test]
    async fn unknown_and_unloaded_primitives_stress_distinctly() {
        let registry = registry_with(&[("primitive-ghost", "no.such.ref")]);
        let vm = ProtocolVm::new(registry);

        let missing = protocol(
            "protocol-missing",
            json!({
                "start": "call",
                "nodes": {"call": {"kind": "call", "ref": "primitive-nope", "inputs": {}}},
                "edges": []
            }),
        );
        let (state, _) = run(&vm, &missing, json!({})).await;
        assert_eq!(state.data.error.unwrap().kind, ErrorKind::PrimitiveNotFound);

        let unloaded = protocol(
            "protocol-unloaded",
            json!({
                "start": "call",
                "nodes": {"call": {"kind": "call", "ref": "primitive-ghost", "inputs": {}}},
                "edges": []
            }),
        );
        let (state, _) = run(&vm, &unloaded, json!({})).await;
        assert_eq!(state.data.error.unwrap().kind, ErrorKind::PrimitiveNotLoaded);
    }

    #[tokio::test]
    async fn call_node_without_ref_is_a_config_error() {
        let registry = registry_with(&[]);
        let vm = ProtocolVm::new(registry);
        let proto = protocol(
            "protocol-bad-node",
            json!({
                "start": "call",
                "nodes": {"call": {"kind": "call", "inputs": {}}},
                "edges": []
            }),
        );
        let (state, _) = run(&vm, &proto, json!({})).await;
        assert_eq!(state.data.error.unwrap().kind, ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn protocol_call_suspends_and_resumes_with_child_result() {
        let registry = registry_with(&[]);
        let inner = protocol(
            "protocol-inner",
            json!({
                "start": "done",
                "nodes": {"done": {"kind": "return", "outputs": {"value": 42}}},
                "edges": []
            }),
        );
        let loader: ProtocolLoader = {
            let inner = inner.clone();
            Arc::new(move |pid| {
                let inner = inner.clone();
                Box::pin(async move {
                    Ok((pid == "protocol-inner").then(|| inner.clone()))
                })
            })
        };
        let vm = ProtocolVm::new(registry).with_loader(loader);

        let outer = protocol(
            "protocol-outer",
            json!({
                "start": "call_inner",
                "nodes": {
                    "call_inner": {"kind": "call", "ref": "protocol-inner", "inputs": {}},
                    "done": {"kind": "return", "outputs": {"out": "$.call_inner.value"}}
                },
                "edges": [{"from": "call_inner", "to": "done"}]
            }),
        );

        let mut state = vm.spawn(&outer, JsonMap::new());
        state.status = StateStatus::Running;

        let (suspended, child) = vm.step(&outer, state, None).await;
        assert_eq!(suspended.status, StateStatus::Suspended);
        let mut child = child.unwrap();
        assert_eq!(child.data.parent_state_id.as_deref(), Some(suspended.id.as_str()));

        // Drive the child to fulfillment, then resume the parent.
        child.status = StateStatus::Running;
        let (child, none) = vm.step(&inner, child, None).await;
        assert!(none.is_none());
        assert_eq!(child.status, StateStatus::Fulfilled);
        let child_output = vm.extract_output(&inner, &child);

        let (mut resumed, _) = vm.step(&outer, suspended, Some(child_output)).await;
        while resumed.status == StateStatus::Running {
            let (next, _) = vm.step(&outer, resumed, None).await;
            resumed = next;
        }
        assert_eq!(resumed.status, StateStatus::Fulfilled);
        let output = vm.extract_output(&outer, &resumed);
        assert_eq!(output["out"], json!(42));
    }

    #[tokio::test]
    async fn missing_sub_protocol_is_a_protocol_error() {
        let registry = registry_with(&[]);
        let loader: ProtocolLoader = Arc::new(|_pid| Box::pin(async { Ok(None) }));
        let vm = ProtocolVm::new(registry).with_loader(loader);
        let proto = protocol(
            "protocol-outer",
            json!({
                "start": "call",
                "nodes": {"call": {"kind": "call", "ref": "protocol-nope", "inputs": {}}},
                "edges": []
            }),
        );
        let mut state = vm.spawn(&proto, JsonMap::new());
        state.status = StateStatus::Running;
        let (state, child) = vm.step(&proto, state, None).await;
        assert!(child.is_none());
        assert_eq!(state.data.error.unwrap().kind, ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn extraction_is_deterministic_across_runs() {
        let registry = registry_with(&[("primitive-echo", "test.echo")]);
        let vm = ProtocolVm::new(registry);
        let proto = protocol(
            "protocol-det",
            json!({
                "start": "say",
                "nodes": {
                    "say": {"kind": "call", "ref": "primitive-echo",
                            "inputs": {"v": "$.inputs.v", "tag": "fixed"}},
                    "done": {"kind": "return",
                             "outputs": {"v": "$.say.v", "tag": "$.say.tag"}}
                },
                "edges": [{"from": "say", "to": "done"}]
            }),
        );

        let (_, first) = run(&vm, &proto, json!({"v": 9})).await;
        let (_, second) = run(&vm, &proto, json!({"v": 9})).await;
        assert_eq!(first, second);
        assert_eq!(first["v"], json!(9));
    }

    #[tokio::test]
    async fn terminal_states_are_inert() {
        let registry = registry_with(&[]);
        let vm = ProtocolVm::new(registry);
        let proto = protocol(
            "protocol-x",
            json!({
                "start": "done",
                "nodes": {"done": {"kind": "return", "outputs": {}}},
                "edges": []
            }),
        );
        let mut state = vm.spawn(&proto, JsonMap::new());
        state.status = StateStatus::Cancelled;
        let (unchanged, child) = vm.step(&proto, state.clone(), None).await;
        assert!(child.is_none());
        assert_eq!(unchanged, state);
    }
}
