//! `io.*` – the membrane.
//!
//! The only domain allowed to touch the output sink. All user-facing output
//! flows through here, which keeps protocol logic decoupled from whatever
//! interface is framing the run (CLI print, server buffer, test collector).

use anyhow::Result;
use serde_json::{json, Value};
use tracing::info;

use strand_types::JsonMap;
use strand_vm::ExecutionContext;

use crate::args::{optional_str, require_context, require_str};

const BOX_WIDTH: usize = 60;

/// `io.ui.render` – render content to the output sink with optional styling.
///
/// Styles: `plain` (default), `box`, `heading`, `success`, `warning`,
/// `error`.
pub async fn ui_render(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let content = require_str(&args, "content")?;
    let style = optional_str(&args, "style").unwrap_or_else(|| "plain".to_string());
    let title = optional_str(&args, "title");

    match style.as_str() {
        "box" => {
            let bar = "─".repeat(BOX_WIDTH - 2);
            ctx.emit(&format!("╭{bar}╮"));
            if let Some(title) = title {
                ctx.emit(&format!("│  {title:<width$}│", width = BOX_WIDTH - 5));
                ctx.emit(&format!("╰{bar}╯"));
            }
            ctx.emit("");
            for line in content.lines() {
                ctx.emit(&format!("  {line}"));
            }
            ctx.emit("");
        }
        "heading" => {
            ctx.emit("");
            ctx.emit(&format!("## {content}"));
            ctx.emit("");
        }
        "success" => ctx.emit(&format!("✓ {content}")),
        "warning" => ctx.emit(&format!("⚠ {content}")),
        "error" => ctx.emit(&format!("✗ {content}")),
        _ => ctx.emit(&content),
    }

    Ok(json!({"status": "success", "rendered": true}))
}

/// `io.sys.log` – log a message to the sink and the tracing layer.
pub async fn sys_log(args: JsonMap, ctx: Option<ExecutionContext>) -> Result<Value> {
    let ctx = require_context(ctx)?;
    let message = require_str(&args, "message")?;
    let level = optional_str(&args, "level").unwrap_or_else(|| "info".to_string());

    info!(target: "strand::protocol", level = %level, "{message}");
    ctx.emit(&format!("[{level}] {message}"));
    Ok(json!({"status": "success"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use strand_store::Store;
    use strand_vm::{OutputSink, PrimitiveRegistry};

    async fn capture() -> (ExecutionContext, Arc<Mutex<Vec<String>>>) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink: OutputSink = {
            let lines = Arc::clone(&lines);
            Arc::new(move |line: &str| lines.lock().unwrap().push(line.to_string()))
        };
        let ctx = ExecutionContext::new(":memory:", store, Arc::new(PrimitiveRegistry::new()))
            .with_sink(Some(sink));
        (ctx, lines)
    }

    fn args(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn plain_render_emits_content_verbatim() {
        let (ctx, lines) = capture().await;
        ui_render(args(json!({"content": "hello"})), Some(ctx)).await.unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["hello"]);
    }

    #[tokio::test]
    async fn styles_shape_the_output() {
        let (ctx, lines) = capture().await;
        ui_render(
            args(json!({"content": "done", "style": "success"})),
            Some(ctx.clone()),
        )
        .await
        .unwrap();
        ui_render(
            args(json!({"content": "a\nb", "style": "box", "title": "T"})),
            Some(ctx),
        )
        .await
        .unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], "✓ done");
        assert!(lines[1].starts_with('╭'));
        assert!(lines.iter().any(|l| l == "  a"));
    }

    #[tokio::test]
    async fn log_prefixes_the_level() {
        let (ctx, lines) = capture().await;
        sys_log(args(json!({"message": "pulse", "level": "warn"})), Some(ctx))
            .await
            .unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["[warn] pulse"]);
    }
}
