//! Bash Tool

use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput};

const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const MAX_TIMEOUT_MS: u64 = 600_000;

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn id(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory and return its combined output."
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required("command", ParamKind::String, "The shell command to run"),
            ParameterSchema::optional(
                "timeout_ms",
                ParamKind::Number,
                "Timeout in milliseconds (default 120000, max 600000)",
            ),
        ]
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("command is required"));
        };
        let timeout = Duration::from_millis(
            args.get("timeout_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_TIMEOUT_MS)
                .min(MAX_TIMEOUT_MS),
        );

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return Ok(ToolOutput::error(format!("Failed to run command: {e}"))),
        };

        // Dropping the output future kills the child (kill_on_drop).
        let output = tokio::select! {
            output = child.wait_with_output() => match output {
                Ok(output) => output,
                Err(e) => return Ok(ToolOutput::error(format!("Command failed: {e}"))),
            },
            _ = tokio::time::sleep(timeout) => {
                return Ok(ToolOutput::error(format!(
                    "Command timed out after {} ms",
                    timeout.as_millis()
                )));
            }
            _ = ctx.cancel.cancelled() => {
                return Ok(ToolOutput::error("Command cancelled"));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        if output.status.success() {
            Ok(ToolOutput::success(text))
        } else {
            let code = output.status.code().unwrap_or(-1);
            Ok(ToolOutput::error(format!(
                "Command exited with status {code}\n{text}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn captures_stdout() {
        let out = BashTool
            .execute(json!({"command": "echo hello"}), ToolContext::detached("."))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_error() {
        let out = BashTool
            .execute(json!({"command": "exit 3"}), ToolContext::detached("."))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("status 3"));
    }

    #[tokio::test]
    async fn timeout_kills_command() {
        let out = BashTool
            .execute(
                json!({"command": "sleep 5", "timeout_ms": 50}),
                ToolContext::detached("."),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_stops_command() {
        let ctx = ToolContext::detached(".");
        ctx.cancel.cancel();
        let out = BashTool
            .execute(json!({"command": "sleep 5"}), ctx)
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("cancelled"));
    }

    #[tokio::test]
    async fn runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = BashTool
            .execute(json!({"command": "ls"}), ToolContext::detached(dir.path()))
            .await
            .unwrap();
        assert!(out.content.contains("marker.txt"));
    }
}
