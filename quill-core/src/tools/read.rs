//! Read Tool

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput};

/// Lines returned when no limit is given.
const DEFAULT_LIMIT: usize = 2000;
/// Individual lines longer than this are clipped.
const MAX_LINE_CHARS: usize = 2000;

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn id(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file from the filesystem. Returns line-numbered content; use offset and limit for large files."
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required("path", ParamKind::String, "The file path to read"),
            ParameterSchema::optional(
                "offset",
                ParamKind::Number,
                "Line number to start reading from (1-based)",
            ),
            ParameterSchema::optional("limit", ParamKind::Number, "Maximum number of lines to read"),
        ]
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("path is required"));
        };
        let path = resolve(path, &ctx.working_dir);

        let offset = args
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|n| (n as usize).saturating_sub(1))
            .unwrap_or(0);
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_LIMIT);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(ToolOutput::error(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        let content = String::from_utf8_lossy(&bytes);

        let total_lines = content.lines().count();
        let mut out = String::new();
        for (i, line) in content.lines().enumerate().skip(offset).take(limit) {
            let line = if line.chars().count() > MAX_LINE_CHARS {
                let clipped: String = line.chars().take(MAX_LINE_CHARS).collect();
                format!("{clipped}…")
            } else {
                line.to_string()
            };
            out.push_str(&format!("{:>6}\t{}\n", i + 1, line));
        }

        if out.is_empty() && offset >= total_lines {
            return Ok(ToolOutput::error(format!(
                "Offset {} is past the end of the file ({} lines)",
                offset + 1,
                total_lines
            )));
        }

        let shown = out.lines().count();
        let title = if shown < total_lines {
            format!("{} ({} of {} lines)", path.display(), shown, total_lines)
        } else {
            path.display().to_string()
        };
        Ok(ToolOutput::with_title(out, title))
    }
}

fn resolve(path: &str, working_dir: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        working_dir.join(p)
    }
}
