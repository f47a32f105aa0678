#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strand-runtime** – Drives Strand protocols and dispatches intents.
//!
//! The runner hydrates the primitive registry from the store, spawns a state
//! for the requested protocol, and loops the VM's `step` with an explicit
//! call stack for sub-protocols until the run is fulfilled or stressed.
//!
//! The engine sits above it as the single entry point every interface
//! converges on: it resolves an intent string to a capability, runs it (via
//! the runner for protocols, directly for primitives), and normalizes the
//! outcome into a JSON-serializable [`DispatchResult`].

pub mod engine;
pub mod runner;

pub use engine::Engine;
pub use runner::{execute_protocol, hydrate_primitives, load_protocol, DEFAULT_MAX_DEPTH};
