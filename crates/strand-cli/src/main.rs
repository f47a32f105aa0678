#![forbid(unsafe_code)]

//! **strand-cli** – Command-line interface for Strand.
//!
//! A thin layer over `Engine::dispatch`: anything stored as a protocol or
//! primitive entity is immediately invocable here, without new code. Results
//! print as JSON on stdout; logs go to stderr.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use strand_runtime::Engine;
use strand_types::JsonMap;
use strand_vm::OutputSink;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Strand - graph-native cognitive virtual machine")]
#[command(version)]
struct Cli {
    /// Path to the Strand database
    #[arg(long, env = "STRAND_DB", default_value = "strand.db")]
    db: String,

    /// Log filter (e.g. info, strand=debug)
    #[arg(long, env = "STRAND_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an intent to a protocol or primitive and execute it
    Invoke {
        /// Capability id or short name (e.g. orient, protocol-orient)
        intent: String,
        /// Input parameters as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Persona to act as
        #[arg(long)]
        persona: Option<String>,
        /// State id to record the run under
        #[arg(long)]
        state_id: Option<String>,
    },
    /// Dump a state snapshot as JSON
    Status {
        /// State id (state-*)
        state_id: String,
    },
    /// List every invocable protocol and primitive
    Capabilities,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    debug!(db = %cli.db, "starting strand cli");

    let engine = Engine::new(&cli.db);

    match cli.command {
        Commands::Invoke { intent, input, persona, state_id } => {
            handle_invoke(&engine, &intent, input, persona, state_id).await?;
        }
        Commands::Status { state_id } => {
            handle_status(&engine, &state_id).await?;
        }
        Commands::Capabilities => {
            handle_capabilities(&engine).await?;
        }
    }

    Ok(())
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

//─────────────────────────────
//  Command handlers
//─────────────────────────────

async fn handle_invoke(
    engine: &Engine,
    intent: &str,
    input: Option<String>,
    persona: Option<String>,
    state_id: Option<String>,
) -> Result<()> {
    let inputs = parse_inputs(input)?;
    let sink: OutputSink = Arc::new(|line: &str| println!("{line}"));

    let result = engine
        .dispatch(intent, inputs, Some(sink), persona.as_deref(), state_id.as_deref())
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.ok {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_inputs(input: Option<String>) -> Result<JsonMap> {
    let Some(raw) = input else {
        return Ok(JsonMap::new());
    };
    match serde_json::from_str::<Value>(&raw).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--input must be a JSON object, got {other}"),
    }
}

async fn handle_status(engine: &Engine, state_id: &str) -> Result<()> {
    let store = engine.store().await.map_err(anyhow::Error::new)?;
    match store.load_state(state_id).await? {
        Some(state) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        None => {
            eprintln!("state not found: {state_id}");
            std::process::exit(1);
        }
    }
}

async fn handle_capabilities(engine: &Engine) -> Result<()> {
    let capabilities = engine.list_capabilities().await.map_err(anyhow::Error::new)?;
    for capability in capabilities {
        let kind = match capability.kind {
            strand_types::CapabilityKind::Protocol => "protocol",
            strand_types::CapabilityKind::Primitive => "primitive",
        };
        println!("{kind:<10} {:<40} {}", capability.id, capability.description);
    }
    Ok(())
}
