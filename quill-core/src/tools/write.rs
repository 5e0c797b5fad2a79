//! Write Tool

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput};

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn id(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write a file to the filesystem, creating parent directories as needed. Overwrites existing content."
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required("path", ParamKind::String, "The file path to write"),
            ParameterSchema::required("content", ParamKind::String, "The content to write"),
        ]
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("path is required"));
        };
        let Some(content) = args.get("content").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("content is required"));
        };

        let path = if Path::new(path).is_absolute() {
            Path::new(path).to_path_buf()
        } else {
            ctx.working_dir.join(path)
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolOutput::error(format!(
                    "Failed to create {}: {e}",
                    parent.display()
                )));
            }
        }

        match tokio::fs::write(&path, content).await {
            Ok(()) => Ok(ToolOutput::with_title(
                format!("Wrote {} bytes to {}", content.len(), path.display()),
                path.display().to_string(),
            )),
            Err(e) => Ok(ToolOutput::error(format!(
                "Failed to write {}: {e}",
                path.display()
            ))),
        }
    }
}
