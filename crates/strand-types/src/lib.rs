#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strand-types** – Shared data structures for the Strand virtual machine.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the typed entity/bond graph vocabulary, the protocol graph
//! shape interpreted by the VM, state snapshots, the append-only event
//! record, and the dispatch surface shared by all external interfaces.
//!
//! Everything here is plain serde data; no I/O, no storage assumptions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

//─────────────────────────────
//  Common aliases and prefixes
//─────────────────────────────

/// JSON object map used for payloads, protocol memory, and argument binding.
pub type JsonMap = serde_json::Map<String, Value>;

/// Id prefix that marks a ref as a protocol (checked before primitive lookup).
pub const PROTOCOL_PREFIX: &str = "protocol-";

/// Id prefix conventionally carried by primitive entity ids.
pub const PRIMITIVE_PREFIX: &str = "primitive-";

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Structured error kinds surfaced by the engine, runner, and VM.
///
/// Every error crossing a component boundary is one of these kinds plus a
/// human-readable message; raw backend errors never leak to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ErrorKind {
    IntentNotFound,
    DatabaseNotFound,
    ProtocolNotFound,
    PrimitiveNotFound,
    PrimitiveNotLoaded,
    PrimitiveExecutionError,
    MappingError,
    RuntimeError,
    ProtocolError,
    ConfigError,
    StorageError,
}

impl ErrorKind {
    /// The wire form of the kind (`snake_case`, matching serde output).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IntentNotFound => "intent_not_found",
            ErrorKind::DatabaseNotFound => "database_not_found",
            ErrorKind::ProtocolNotFound => "protocol_not_found",
            ErrorKind::PrimitiveNotFound => "primitive_not_found",
            ErrorKind::PrimitiveNotLoaded => "primitive_not_loaded",
            ErrorKind::PrimitiveExecutionError => "primitive_execution_error",
            ErrorKind::MappingError => "mapping_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::StorageError => "storage_error",
        }
    }

    /// Parse the wire form back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error: kind, message, and optional details payload.
///
/// Used both inside state snapshots (a STRESSED state carries one) and as
/// the error type returned by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StateError {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured details, `{}` when there are none.
    #[serde(default)]
    pub details: Value,
}

impl StateError {
    /// Build an error with empty details.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), details: Value::Object(JsonMap::new()) }
    }
}

//─────────────────────────────
//  Entities and bonds
//─────────────────────────────

/// A typed row in the entity graph: stable slug id, type tag, opaque JSON.
///
/// The store imposes no schema on `data`; readers that need structure parse
/// it into the typed views below (`PrimitiveEntity`, `ProtocolEntity`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable ASCII slug, unique process-wide.
    pub id: String,
    /// Short ASCII type tag; writers set it, readers never infer.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Arbitrary JSON payload.
    pub data: Value,
}

/// Entity type tag used for the mirrored bond entities.
pub const RELATIONSHIP_TYPE: &str = "relationship";

/// A directed, typed, confidence-weighted relation between entities.
///
/// Bonds are projected state: each row here is mirrored as an entity of type
/// `relationship`, so bonds can themselves be subjects of other bonds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bond {
    /// Bond id (shared with the mirrored relationship entity).
    pub id: String,
    /// Relation type, e.g. `surfaces`, `verifies`.
    #[serde(rename = "type")]
    pub bond_type: String,
    /// Source entity id.
    pub from_id: String,
    /// Target entity id.
    pub to_id: String,
    /// Bond state (`forming`, `active`, `stressed`, `dissolved`).
    pub status: String,
    /// Epistemic certainty, clamped to `[0.0, 1.0]` on write.
    pub confidence: f64,
    /// Additional metadata.
    pub data: Value,
}

/// The full tension network around one entity: outgoing plus incoming bonds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constellation {
    /// The entity at the center.
    pub entity_id: String,
    /// Bonds originating from the entity.
    pub outgoing: Vec<Bond>,
    /// Bonds pointing at the entity.
    pub incoming: Vec<Bond>,
}

//─────────────────────────────
//  Primitive entities
//─────────────────────────────

/// Payload of a `primitive` entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveData {
    /// Opaque handler locator - a key into the handler symbol table.
    pub handler_ref: String,
    /// Short human description for capability listings.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared `{inputs, outputs}` interface block (informative).
    #[serde(default)]
    pub interface: Value,
}

/// A `primitive` entity: a named callable exposed to protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveEntity {
    /// Entity id, conventionally `primitive-*` or `domain.noun.verb`.
    pub id: String,
    /// Typed payload.
    pub data: PrimitiveData,
}

//─────────────────────────────
//  Protocol graph
//─────────────────────────────

/// The two node kinds a protocol graph may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Invoke a primitive or a sub-protocol and store its result in memory.
    Call,
    /// Terminate the run and assemble the declared outputs.
    Return,
}

/// Comparison operators usable in edge conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Contains,
    Empty,
}

/// A condition attached to an edge: `resolve(path) <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCondition {
    /// Comparison operator.
    pub op: ConditionOp,
    /// Memory path expression, e.g. `$.check.found`.
    pub path: String,
    /// Right-hand value; `null` when the operator is unary (`empty`).
    #[serde(default)]
    pub value: Value,
}

/// A single node in a protocol graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolNode {
    /// CALL or RETURN.
    pub kind: NodeKind,
    /// For CALL nodes: primitive id or `protocol-*` ref.
    #[serde(rename = "ref", default)]
    pub node_ref: Option<String>,
    /// For CALL nodes: parameter name → expression.
    #[serde(default)]
    pub inputs: JsonMap,
    /// For RETURN nodes: output name → expression.
    #[serde(default)]
    pub outputs: JsonMap,
}

/// A directed edge; at most one of `condition` / `default` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEdge {
    /// Source node id.
    #[serde(rename = "from")]
    pub from_node: String,
    /// Target node id.
    #[serde(rename = "to")]
    pub to_node: String,
    /// Conditional edges are considered first, in declaration order.
    #[serde(default)]
    pub condition: Option<EdgeCondition>,
    /// Default edges fire when no conditional edge matched.
    #[serde(default)]
    pub default: bool,
}

/// A protocol graph: entry node plus nodes and edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolGraph {
    /// Entry node id.
    pub start: String,
    /// Node table keyed by node id.
    pub nodes: BTreeMap<String, ProtocolNode>,
    /// Edge list, order significant for conditional evaluation.
    #[serde(default)]
    pub edges: Vec<ProtocolEdge>,
}

/// Declared `{inputs, outputs}` interface of a protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolInterface {
    /// Named input parameters (informative; not validated by the VM).
    #[serde(default)]
    pub inputs: Value,
    /// Named outputs (informative).
    #[serde(default)]
    pub outputs: Value,
    /// Optional human description for capability listings.
    #[serde(default)]
    pub description: Option<String>,
}

/// Payload of a `protocol` entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolData {
    /// Declared interface.
    #[serde(default)]
    pub interface: ProtocolInterface,
    /// The executable graph.
    pub graph: ProtocolGraph,
    /// Optional title for palettes and listings.
    #[serde(default)]
    pub title: Option<String>,
    /// Optional description (fallback when the interface carries none).
    #[serde(default)]
    pub description: Option<String>,
}

/// A `protocol` entity: a directed graph of CALL/RETURN nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEntity {
    /// Entity id, conventionally `protocol-*`.
    pub id: String,
    /// Monotonic version, recorded in state snapshots.
    #[serde(default = "default_version")]
    pub version: i64,
    /// Typed payload.
    pub data: ProtocolData,
}

fn default_version() -> i64 {
    1
}

//─────────────────────────────
//  State snapshots
//─────────────────────────────

/// Lifecycle of one protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum StateStatus {
    Pending,
    Running,
    Fulfilled,
    Stressed,
    Suspended,
    Cancelled,
}

/// The mutable body of a state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    /// Protocol this run executes.
    pub protocol_id: String,
    /// Protocol version at spawn time.
    pub protocol_version: i64,
    /// Set on child states spawned by a sub-protocol CALL.
    #[serde(default)]
    pub parent_state_id: Option<String>,
    /// Current node id; `null` once terminal.
    #[serde(default)]
    pub cursor: Option<String>,
    /// The RETURN node that terminated the run; `null` if STRESSED.
    #[serde(default)]
    pub exit_node: Option<String>,
    /// Node-id → result map, plus the reserved `"inputs"` key.
    #[serde(default)]
    pub memory: JsonMap,
    /// Present when `status == stressed`.
    #[serde(default)]
    pub error: Option<StateError>,
}

/// One in-flight (or terminal) protocol run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// State id (`state-*`).
    pub id: String,
    /// Lifecycle status.
    pub status: StateStatus,
    /// Snapshot body.
    pub data: StateData,
}

//─────────────────────────────
//  Event log records
//─────────────────────────────

/// Event families written by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventType {
    Manifest,
    Bond,
    Signal,
    ProtocolSpawn,
    ProtocolStep,
}

/// Outcome tag carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum EventOp {
    Success,
    Error,
    Retry,
    Suspend,
    Resume,
}

/// Per-actor logical clock; `seq` is monotonic within one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventClock {
    /// Writing actor.
    pub actor: String,
    /// Monotonic sequence number within the actor.
    pub seq: i64,
}

/// One append-only event log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event id (`event-*`).
    pub id: String,
    /// Logical clock.
    pub clock: EventClock,
    /// Event family.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Outcome tag.
    pub op: EventOp,
    /// Optional persona attribution.
    #[serde(default)]
    pub persona_id: Option<String>,
    /// Optional signature (opaque to the core).
    #[serde(default)]
    pub signature: Option<String>,
    /// Arbitrary JSON payload.
    pub payload: Value,
}

//─────────────────────────────
//  Dispatch surface
//─────────────────────────────

/// The two kinds of invocable capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum CapabilityKind {
    Protocol,
    Primitive,
}

/// A discoverable capability: everything interfaces need to enumerate and
/// invoke it, without hardcoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Full entity id.
    pub id: String,
    /// Protocol or primitive.
    pub kind: CapabilityKind,
    /// Short human description.
    pub description: String,
    /// Declared interface block.
    pub interface: Value,
}

/// Result of a dispatch: JSON-serializable, never a raw backend error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    /// Whether the dispatch succeeded.
    pub ok: bool,
    /// Output payload (empty on failure).
    #[serde(default)]
    pub data: JsonMap,
    /// Error kind when `ok == false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Error message when `ok == false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DispatchResult {
    /// A successful result carrying `data`.
    pub fn success(data: JsonMap) -> Self {
        Self { ok: true, data, error_kind: None, error_message: None }
    }

    /// A failed result with a structured kind and message.
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: JsonMap::new(),
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }
}

impl From<StateError> for DispatchResult {
    fn from(err: StateError) -> Self {
        DispatchResult::failure(err.kind, err.message)
    }
}
