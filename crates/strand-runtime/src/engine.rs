//! The engine: single point of entry for every interface.
//!
//! CLI, HTTP, and worker adapters all translate user intent into
//! [`Engine::dispatch`] calls. The engine resolves the intent to a protocol
//! or primitive capability, executes it, and normalizes the outcome — so a
//! protocol added to the database instantly becomes an invocable command on
//! every surface without new code.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::OnceCell;

use strand_store::Store;
use strand_types::{
    Capability, CapabilityKind, DispatchResult, ErrorKind, JsonMap, StateError,
    PRIMITIVE_PREFIX, PROTOCOL_PREFIX,
};
use strand_vm::{ExecutionContext, OutputSink, PrimitiveRegistry};

use crate::runner::{execute_protocol, hydrate_primitives};

/// The unified dispatch surface over one database.
pub struct Engine {
    db_path: String,
    store: OnceCell<Arc<Store>>,
    registry: OnceCell<Arc<PrimitiveRegistry>>,
}

impl Engine {
    /// Build an engine over the database at `db_path`.
    ///
    /// The store and registry hydrate lazily on first use.
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            store: OnceCell::new(),
            registry: OnceCell::new(),
        }
    }

    /// The database path this engine dispatches against.
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// The lazily opened store handle.
    pub async fn store(&self) -> Result<Arc<Store>, StateError> {
        self.store
            .get_or_try_init(|| async {
                if !Path::new(&self.db_path).exists() {
                    return Err(StateError::new(
                        ErrorKind::DatabaseNotFound,
                        format!("database not found: {}", self.db_path),
                    ));
                }
                Store::open(&self.db_path)
                    .await
                    .map(Arc::new)
                    .map_err(|err| StateError::new(ErrorKind::StorageError, err.to_string()))
            })
            .await
            .cloned()
    }

    async fn registry(&self) -> Result<Arc<PrimitiveRegistry>, StateError> {
        let store = self.store().await?;
        self.registry
            .get_or_try_init(|| async {
                let registry = Arc::new(PrimitiveRegistry::new());
                hydrate_primitives(&store, &registry, &strand_primitives::resolver()).await?;
                Ok(registry)
            })
            .await
            .cloned()
    }

    /// Enumerate every protocol and primitive with its declared interface.
    ///
    /// This is what powers CLI help, discovery endpoints, and palettes —
    /// nothing is hardcoded.
    pub async fn list_capabilities(&self) -> Result<Vec<Capability>, StateError> {
        let store = self.store().await?;
        let mut capabilities = Vec::new();

        for entity in store
            .list_entities_by_type("protocol")
            .await
            .map_err(|err| StateError::new(ErrorKind::StorageError, err.to_string()))?
        {
            let interface = entity.data.get("interface").cloned().unwrap_or_else(|| json!({}));
            let description = interface
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    entity
                        .data
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("Protocol {}", entity.id));
            capabilities.push(Capability {
                id: entity.id,
                kind: CapabilityKind::Protocol,
                description,
                interface,
            });
        }

        for entity in store
            .list_entities_by_type("primitive")
            .await
            .map_err(|err| StateError::new(ErrorKind::StorageError, err.to_string()))?
        {
            let description = entity
                .data
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Primitive {}", entity.id));
            let interface = entity.data.get("interface").cloned().unwrap_or_else(|| json!({}));
            capabilities.push(Capability {
                id: entity.id,
                kind: CapabilityKind::Primitive,
                description,
                interface,
            });
        }

        Ok(capabilities)
    }

    /// Resolve an intent string to a capability.
    ///
    /// Exact ids win; then short names with the `protocol-` / `primitive-`
    /// prefix stripped (primitives also answer to underscore variants). A
    /// bare short name claimed by both kinds resolves to the protocol.
    pub async fn resolve_intent(&self, intent: &str) -> Result<Option<Capability>, StateError> {
        let capabilities = self.list_capabilities().await?;

        if let Some(capability) = capabilities.iter().find(|c| c.id == intent) {
            return Ok(Some(capability.clone()));
        }

        // Primitives first so protocol entries overwrite on collision.
        let mut by_short_name: HashMap<String, &Capability> = HashMap::new();
        for capability in capabilities.iter().filter(|c| c.kind == CapabilityKind::Primitive) {
            if let Some(short) = capability.id.strip_prefix(PRIMITIVE_PREFIX) {
                by_short_name.insert(short.to_string(), capability);
                by_short_name.insert(short.replace('-', "_"), capability);
            }
        }
        for capability in capabilities.iter().filter(|c| c.kind == CapabilityKind::Protocol) {
            if let Some(short) = capability.id.strip_prefix(PROTOCOL_PREFIX) {
                by_short_name.insert(short.to_string(), capability);
            }
        }

        Ok(by_short_name.get(intent).map(|c| (*c).clone()))
    }

    /// Resolve `intent`, execute it, and normalize the result.
    ///
    /// The only entry point interfaces should use.
    pub async fn dispatch(
        &self,
        intent: &str,
        inputs: JsonMap,
        output_sink: Option<OutputSink>,
        persona_id: Option<&str>,
        state_id: Option<&str>,
    ) -> DispatchResult {
        let capability = match self.resolve_intent(intent).await {
            Ok(Some(capability)) => capability,
            Ok(None) => {
                return DispatchResult::failure(
                    ErrorKind::IntentNotFound,
                    format!("could not resolve intent: {intent}"),
                )
            }
            Err(err) => return err.into(),
        };

        match capability.kind {
            CapabilityKind::Protocol => {
                match execute_protocol(
                    &self.db_path,
                    &capability.id,
                    inputs,
                    persona_id,
                    state_id,
                    output_sink,
                )
                .await
                {
                    Ok(outputs) => normalize_protocol_outputs(outputs),
                    Err(err) => err.into(),
                }
            }
            CapabilityKind::Primitive => {
                self.dispatch_primitive(&capability.id, inputs, output_sink, persona_id)
                    .await
            }
        }
    }

    async fn dispatch_primitive(
        &self,
        primitive_id: &str,
        inputs: JsonMap,
        output_sink: Option<OutputSink>,
        persona_id: Option<&str>,
    ) -> DispatchResult {
        let registry = match self.registry().await {
            Ok(registry) => registry,
            Err(err) => return err.into(),
        };
        let record = match registry.get(primitive_id) {
            Ok(record) => record,
            Err(_) => {
                return DispatchResult::failure(
                    ErrorKind::PrimitiveNotFound,
                    format!("primitive not registered: {primitive_id}"),
                )
            }
        };
        let Some(handler) = record.handler.clone() else {
            return DispatchResult::failure(
                ErrorKind::PrimitiveNotLoaded,
                format!("primitive handler could not be loaded: {primitive_id}"),
            );
        };

        let context = if handler.accepts_context {
            let store = match self.store().await {
                Ok(store) => store,
                Err(err) => return err.into(),
            };
            Some(
                ExecutionContext::new(self.db_path.clone(), store, Arc::clone(&registry))
                    .with_persona(persona_id.map(str::to_string))
                    .with_sink(output_sink),
            )
        } else {
            None
        };

        match (handler.func)(inputs, context).await {
            Ok(Value::Object(data)) => DispatchResult::success(data),
            Ok(other) => {
                let mut data = JsonMap::new();
                data.insert("result".to_string(), other);
                DispatchResult::success(data)
            }
            Err(err) => {
                DispatchResult::failure(ErrorKind::PrimitiveExecutionError, err.to_string())
            }
        }
    }
}

/// A top-level `error_kind` in protocol outputs promotes `ok = false`.
fn normalize_protocol_outputs(outputs: JsonMap) -> DispatchResult {
    if let Some(kind) = outputs.get("error_kind").and_then(Value::as_str) {
        let message = outputs
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return DispatchResult::failure(
            ErrorKind::parse(kind).unwrap_or(ErrorKind::RuntimeError),
            message,
        );
    }
    DispatchResult::success(outputs)
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}
