//! `sys.*` – sandboxed environment interaction.
//!
//! Subprocess execution without shell interpolation: commands are argv
//! lists, never strings, timeouts are enforced with both a floor and a
//! ceiling, and captured output is size-capped. Also home to sub-protocol
//! invocation through the registry hook and deliberate failure injection.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::process::Command;

use strand_types::JsonMap;
use strand_vm::ExecutionContext;

use crate::args::{
    optional_i64, optional_object, optional_str, require_array, require_context, require_str,
};

/// Maximum bytes captured per stream.
const MAX_OUTPUT_SIZE: usize = 256 * 1024;

/// Default wall-clock timeout in seconds.
const DEFAULT_TIMEOUT_SECS: i64 = 300;

/// Upper bound on the wall-clock timeout; requests above it are clamped.
const MAX_TIMEOUT_SECS: i64 = 3600;

fn effective_timeout(requested: Option<i64>) -> i64 {
    requested.unwrap_or(DEFAULT_TIMEOUT_SECS).clamp(1, MAX_TIMEOUT_SECS)
}

/// `sys.shell.run` – execute a command in a subprocess with constraints.
///
/// The command is an argv list; no shell is ever involved. Expiry of the
/// wall-clock timeout reports `{status: "error", timed_out: true}` at the
/// data level so protocols can branch on it.
pub async fn shell_run(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let cmd = require_array(&args, "cmd")?;
    let argv: Vec<String> = cmd
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("cmd must be a list of strings"))
        })
        .collect::<Result<_>>()?;
    if argv.is_empty() {
        bail!("cmd must not be empty");
    }

    let cwd = optional_str(&args, "cwd");
    let timeout_secs = effective_timeout(optional_i64(&args, "timeout"));
    let extra_env = optional_object(&args, "env")?;

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &extra_env {
        if let Some(value) = value.as_str() {
            command.env(key, value);
        }
    }

    let output = match tokio::time::timeout(
        Duration::from_secs(timeout_secs as u64),
        command.output(),
    )
    .await
    {
        Err(_) => {
            return Ok(json!({
                "status": "error",
                "error": format!("command timed out after {timeout_secs}s"),
                "timed_out": true,
                "command": argv,
            }));
        }
        Ok(Err(err)) => {
            return Ok(json!({
                "status": "error",
                "error": format!("failed to spawn {}: {err}", argv[0]),
                "timed_out": false,
                "command": argv,
            }));
        }
        Ok(Ok(output)) => output,
    };

    let (stdout, out_truncated) = capped_utf8(&output.stdout);
    let (stderr, err_truncated) = capped_utf8(&output.stderr);

    Ok(json!({
        "status": "success",
        "exit_code": output.status.code().unwrap_or(-1),
        "stdout": stdout,
        "stderr": stderr,
        "truncated": out_truncated || err_truncated,
        "timed_out": false,
        "command": argv,
        "cwd": cwd,
    }))
}

fn capped_utf8(bytes: &[u8]) -> (String, bool) {
    let truncated = bytes.len() > MAX_OUTPUT_SIZE;
    let slice = if truncated { &bytes[..MAX_OUTPUT_SIZE] } else { bytes };
    (String::from_utf8_lossy(slice).into_owned(), truncated)
}

/// `sys.protocol.run` – run a sub-protocol through the registry hook.
///
/// This is how primitives re-enter the runner without a compile-time
/// dependency on it: the invoker hook is installed on the registry per run.
/// Failures, including a missing hook, come back at the data level so the
/// calling protocol can branch on them.
pub async fn protocol_run(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let protocol_id = require_str(&args, "protocol_id")?;
    let inputs = optional_object(&args, "inputs")?;

    match ctx.registry.invoke_protocol(&protocol_id, inputs).await {
        Ok(outputs) => Ok(json!({
            "status": "success",
            "protocol_id": protocol_id,
            "outputs": outputs,
        })),
        Err(err) => Ok(json!({"status": "error", "error": err.to_string()})),
    }
}

/// `sys.fail` – fail deliberately with the given message.
///
/// Exists so protocols and their tests can exercise error propagation: the
/// raised failure surfaces as a `runtime_error` STRESSED state.
pub async fn fail(args: JsonMap, _ctx: Option<ExecutionContext>) -> Result<Value> {
    let message = require_str(&args, "message").unwrap_or_else(|_| "failed".to_string());
    bail!(message)
}
