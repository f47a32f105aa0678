//! Primitive registry: binds primitive entities to callable handlers.
//!
//! Registration resolves the entity's `handler_ref` through a caller-supplied
//! resolver. Unresolvable refs are kept with `handler: None` so capability
//! listings still see them; only invocation fails. The registry also carries
//! the per-run protocol-invoker hook, which lets primitives run sub-protocols
//! without a compile-time dependency on the runner.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use strand_types::{JsonMap, PrimitiveEntity};

use crate::context::ExecutionContext;

/// A bound primitive handler: by-name JSON arguments in, JSON value out.
pub type PrimitiveFn = Arc<
    dyn Fn(JsonMap, Option<ExecutionContext>) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
>;

/// A handler plus its context marker (replaces signature reflection).
#[derive(Clone)]
pub struct RegisteredHandler {
    /// The callable.
    pub func: PrimitiveFn,
    /// Whether the handler takes the [`ExecutionContext`].
    pub accepts_context: bool,
}

/// Maps a `handler_ref` locator to a callable, or `None` if unloadable.
pub type HandlerResolver = Arc<dyn Fn(&str) -> Option<RegisteredHandler> + Send + Sync>;

/// Callback primitives use to run a sub-protocol: `(protocol_id, inputs)`.
pub type ProtocolInvoker = Arc<
    dyn Fn(String, JsonMap) -> BoxFuture<'static, anyhow::Result<JsonMap>> + Send + Sync,
>;

/// One registered primitive: the entity record plus its handler, if bound.
pub struct PrimitiveRecord {
    /// The primitive entity as stored.
    pub entity: PrimitiveEntity,
    /// Bound handler; `None` when the locator could not be resolved.
    pub handler: Option<RegisteredHandler>,
}

/// Registry failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No record for the requested id.
    #[error("primitive not found: {0}")]
    PrimitiveNotFound(String),
    /// `invoke_protocol` was called before an invoker was registered.
    #[error("no protocol invoker registered")]
    NoInvoker,
}

/// Thread-safe primitive registry, one instance per run.
#[derive(Default)]
pub struct PrimitiveRegistry {
    records: RwLock<HashMap<String, Arc<PrimitiveRecord>>>,
    invoker: RwLock<Option<ProtocolInvoker>>,
}

impl PrimitiveRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a primitive entity, binding its `handler_ref` via `resolver`.
    ///
    /// A ref the resolver cannot satisfy registers with `handler: None`; the
    /// record stays enumerable and only invocation fails.
    pub fn register_from_entity(&self, entity: PrimitiveEntity, resolver: &HandlerResolver) {
        let handler = resolver(&entity.data.handler_ref);
        if handler.is_none() {
            debug!(
                primitive = %entity.id,
                handler_ref = %entity.data.handler_ref,
                "handler ref did not resolve; registering unloaded"
            );
        }
        let record = Arc::new(PrimitiveRecord { entity, handler });
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(record.entity.id.clone(), record);
    }

    /// Look up a primitive by id.
    pub fn get(&self, primitive_id: &str) -> Result<Arc<PrimitiveRecord>, RegistryError> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(primitive_id)
            .cloned()
            .ok_or_else(|| RegistryError::PrimitiveNotFound(primitive_id.to_string()))
    }

    /// Registered primitive ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered primitives.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install the protocol-invoker hook for this run.
    pub fn set_protocol_invoker(&self, invoker: ProtocolInvoker) {
        *self
            .invoker
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(invoker);
    }

    /// Run a sub-protocol through the installed hook.
    pub async fn invoke_protocol(
        &self,
        protocol_id: &str,
        inputs: JsonMap,
    ) -> anyhow::Result<JsonMap> {
        let invoker = self
            .invoker
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(RegistryError::NoInvoker)?;
        invoker(protocol_id.to_string(), inputs).await
    }
}

impl std::fmt::Debug for PrimitiveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_types::PrimitiveData;

    fn primitive(id: &str, handler_ref: &str) -> PrimitiveEntity {
        PrimitiveEntity {
            id: id.to_string(),
            data: PrimitiveData {
                handler_ref: handler_ref.to_string(),
                description: None,
                interface: json!({}),
            },
        }
    }

    fn echo_resolver() -> HandlerResolver {
        Arc::new(|handler_ref| {
            if handler_ref != "test.echo" {
                return None;
            }
            let func: PrimitiveFn = Arc::new(|args, _ctx| {
                Box::pin(async move { Ok(Value::Object(args)) })
            });
            Some(RegisteredHandler { func, accepts_context: false })
        })
    }

    #[tokio::test]
    async fn unresolvable_refs_stay_enumerable() {
        let registry = PrimitiveRegistry::new();
        let resolver = echo_resolver();
        registry.register_from_entity(primitive("primitive-echo", "test.echo"), &resolver);
        registry.register_from_entity(primitive("primitive-ghost", "no.such.ref"), &resolver);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("primitive-echo").unwrap().handler.is_some());
        assert!(registry.get("primitive-ghost").unwrap().handler.is_none());
        assert!(matches!(
            registry.get("primitive-missing"),
            Err(RegistryError::PrimitiveNotFound(_))
        ));
    }

    #[tokio::test]
    async fn invoke_protocol_requires_an_invoker() {
        let registry = PrimitiveRegistry::new();
        let err = registry.invoke_protocol("protocol-x", JsonMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("no protocol invoker"));

        registry.set_protocol_invoker(Arc::new(|pid, _inputs| {
            Box::pin(async move {
                let mut out = JsonMap::new();
                out.insert("ran".into(), json!(pid));
                Ok(out)
            })
        }));
        let out = registry.invoke_protocol("protocol-x", JsonMap::new()).await.unwrap();
        assert_eq!(out["ran"], json!("protocol-x"));
    }
}
