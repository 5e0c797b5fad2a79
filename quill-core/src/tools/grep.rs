//! Grep Tool

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::glob::{glob_match, match_segment, walk_files};
use crate::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput};

/// Matches reported before the output is cut off.
const MAX_MATCHES: usize = 200;

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn id(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns path:line:text matches."
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required(
                "pattern",
                ParamKind::String,
                "The regular expression to search for",
            ),
            ParameterSchema::optional("path", ParamKind::String, "The directory to search in"),
            ParameterSchema::optional(
                "glob",
                ParamKind::String,
                "Only search files matching this glob pattern",
            ),
        ]
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let Some(pattern) = args.get("pattern").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("pattern is required"));
        };
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => return Ok(ToolOutput::error(format!("Invalid regex: {e}"))),
        };

        let base = match args.get("path").and_then(|v| v.as_str()) {
            Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => ctx.working_dir.join(p),
            None => ctx.working_dir.clone(),
        };
        if !base.exists() {
            return Ok(ToolOutput::error(format!(
                "Path not found: {}",
                base.display()
            )));
        }

        let file_filter = args
            .get("glob")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let (matches, truncated) = tokio::task::spawn_blocking(move || {
            let mut matches: Vec<String> = Vec::new();
            let mut truncated = false;

            let mut files = walk_files(&base);
            files.sort();

            'files: for rel in files {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if let Some(ref filter) = file_filter {
                    let name = rel
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let hit = if filter.contains('/') {
                        glob_match(filter, &rel_str)
                    } else {
                        match_segment(filter, &name)
                    };
                    if !hit {
                        continue;
                    }
                }

                let Ok(bytes) = std::fs::read(base.join(&rel)) else {
                    continue;
                };
                if bytes.contains(&0) {
                    continue; // binary
                }
                let content = String::from_utf8_lossy(&bytes);

                for (i, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        if matches.len() >= MAX_MATCHES {
                            truncated = true;
                            break 'files;
                        }
                        matches.push(format!("{}:{}:{}", rel_str, i + 1, line.trim_end()));
                    }
                }
            }

            (matches, truncated)
        })
        .await?;

        if matches.is_empty() {
            return Ok(ToolOutput::success(format!("No matches for: {pattern}")));
        }

        let count = matches.len();
        let mut content = matches.join("\n");
        if truncated {
            content.push_str(&format!("\n... [stopped after {MAX_MATCHES} matches]"));
        }
        Ok(ToolOutput::with_title(
            content,
            format!("Found {count} matches"),
        ))
    }
}
