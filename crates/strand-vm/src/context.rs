//! Per-run execution context injected into primitive handlers.

use std::fmt;
use std::sync::Arc;

use strand_store::Store;

use crate::registry::PrimitiveRegistry;

/// User-visible output channel: the only path from handlers to a display.
///
/// The CLI passes a print function, a server passes a buffer collector. The
/// sink is what keeps the logic layer decoupled from any interface framing.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Shared resources handed to primitives that declare they accept context.
///
/// The context is per run and never serialized with state snapshots.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Path of the backing database.
    pub db_path: String,
    /// Open store handle, shared across the run.
    pub store: Arc<Store>,
    /// The run's registry; carries the protocol-invoker hook through which
    /// primitives run sub-protocols without depending on the runner.
    pub registry: Arc<PrimitiveRegistry>,
    /// Persona the run acts as, if any.
    pub persona_id: Option<String>,
    /// State id of the run, if assigned.
    pub state_id: Option<String>,
    /// Output sink; when absent, output falls through to stdout.
    pub output_sink: Option<OutputSink>,
}

impl ExecutionContext {
    /// Build a context over an open store and the run's registry.
    pub fn new(
        db_path: impl Into<String>,
        store: Arc<Store>,
        registry: Arc<PrimitiveRegistry>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            store,
            registry,
            persona_id: None,
            state_id: None,
            output_sink: None,
        }
    }

    /// Attach a persona id.
    pub fn with_persona(mut self, persona_id: Option<String>) -> Self {
        self.persona_id = persona_id;
        self
    }

    /// Attach a state id.
    pub fn with_state(mut self, state_id: Option<String>) -> Self {
        self.state_id = state_id;
        self
    }

    /// Attach an output sink.
    pub fn with_sink(mut self, sink: Option<OutputSink>) -> Self {
        self.output_sink = sink;
        self
    }

    /// Send one line of user-visible output to the sink, or stdout.
    pub fn emit(&self, content: &str) {
        match &self.output_sink {
            Some(sink) => sink(content),
            None => println!("{content}"),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("db_path", &self.db_path)
            .field("persona_id", &self.persona_id)
            .field("state_id", &self.state_id)
            .field("output_sink", &self.output_sink.as_ref().map(|_| "<sink>"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn emit_routes_through_the_sink() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let registry = Arc::new(PrimitiveRegistry::new());
        let captured = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink: OutputSink = {
            let captured = Arc::clone(&captured);
            Arc::new(move |line| captured.lock().unwrap().push(line.to_string()))
        };

        let ctx = ExecutionContext::new(":memory:", store, registry)
            .with_persona(Some("persona-1".into()))
            .with_sink(Some(sink));
        ctx.emit("hello");
        ctx.emit("world");

        assert_eq!(*captured.lock().unwrap(), vec!["hello", "world"]);
        assert_eq!(ctx.persona_id.as_deref(), Some("persona-1"));
    }
}
