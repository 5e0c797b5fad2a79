//! Edit Tool

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput};

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn id(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. The old string must match exactly once unless replace_all is set."
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required("path", ParamKind::String, "The file path to edit"),
            ParameterSchema::required("old_string", ParamKind::String, "The exact text to replace"),
            ParameterSchema::required("new_string", ParamKind::String, "The replacement text"),
            ParameterSchema::optional(
                "replace_all",
                ParamKind::Boolean,
                "Replace every occurrence instead of requiring a unique match",
            ),
        ]
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("path is required"));
        };
        let Some(old_string) = args.get("old_string").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("old_string is required"));
        };
        let Some(new_string) = args.get("new_string").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("new_string is required"));
        };
        let replace_all = args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if old_string.is_empty() {
            return Ok(ToolOutput::error("old_string must not be empty"));
        }
        if old_string == new_string {
            return Ok(ToolOutput::error("old_string and new_string are identical"));
        }

        let path = if Path::new(path).is_absolute() {
            Path::new(path).to_path_buf()
        } else {
            ctx.working_dir.join(path)
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                return Ok(ToolOutput::error(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        let occurrences = content.matches(old_string).count();
        if occurrences == 0 {
            return Ok(ToolOutput::error(format!(
                "old_string not found in {}",
                path.display()
            )));
        }
        if occurrences > 1 && !replace_all {
            return Ok(ToolOutput::error(format!(
                "old_string appears {occurrences} times in {}; provide more context or set replace_all",
                path.display()
            )));
        }

        let updated = if replace_all {
            content.replace(old_string, new_string)
        } else {
            content.replacen(old_string, new_string, 1)
        };

        if let Err(e) = tokio::fs::write(&path, &updated).await {
            return Ok(ToolOutput::error(format!(
                "Failed to write {}: {e}",
                path.display()
            )));
        }

        let replaced = if replace_all { occurrences } else { 1 };
        Ok(ToolOutput::with_title(
            format!(
                "Replaced {replaced} occurrence{} in {}",
                if replaced == 1 { "" } else { "s" },
                path.display()
            ),
            path.display().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn edit(dir: &Path, args: Value) -> ToolOutput {
        EditTool
            .execute(args, ToolContext::detached(dir))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unique_replacement() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.rs"), "fn old_name() {}").unwrap();

        let out = edit(
            dir.path(),
            json!({"path": "f.rs", "old_string": "old_name", "new_string": "new_name"}),
        )
        .await;
        assert!(!out.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.rs")).unwrap(),
            "fn new_name() {}"
        );
    }

    #[tokio::test]
    async fn ambiguous_match_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "aaa aaa").unwrap();

        let out = edit(
            dir.path(),
            json!({"path": "f.txt", "old_string": "aaa", "new_string": "bbb"}),
        )
        .await;
        assert!(out.is_error);
        assert!(out.content.contains("2 times"));
    }

    #[tokio::test]
    async fn replace_all_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "aaa aaa").unwrap();

        let out = edit(
            dir.path(),
            json!({"path": "f.txt", "old_string": "aaa", "new_string": "b", "replace_all": true}),
        )
        .await;
        assert!(!out.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "b b"
        );
    }

    #[tokio::test]
    async fn missing_old_string_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "hello").unwrap();

        let out = edit(
            dir.path(),
            json!({"path": "f.txt", "old_string": "absent", "new_string": "x"}),
        )
        .await;
        assert!(out.is_error);
        assert!(out.content.contains("not found"));
    }
}
