//! Task Tool
//!
//! Delegates a self-contained piece of work to a child session with a
//! fresh transcript. The child's streamed output becomes this tool's
//! result; its cancellation is chained to the invoking tool context.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::session::SessionCallbacks;
use crate::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput};
use crate::types::AgentType;

pub struct TaskTool;

#[async_trait]
impl Tool for TaskTool {
    fn id(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Launch a new agent to handle complex, multistep tasks autonomously."
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required("prompt", ParamKind::String, "The task for the agent to perform"),
            ParameterSchema::required(
                "description",
                ParamKind::String,
                "A short description of the task",
            ),
            ParameterSchema {
                enum_values: Some(vec!["general".into(), "explore".into(), "plan".into()]),
                ..ParameterSchema::required(
                    "subagent_type",
                    ParamKind::String,
                    "The type of agent to use",
                )
            },
        ]
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let Some(prompt) = args.get("prompt").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("prompt is required"));
        };
        let description = args
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let agent_type = AgentType::parse(
            args.get("subagent_type")
                .and_then(|v| v.as_str())
                .unwrap_or("general"),
        );

        let Some(ref factory) = ctx.subagents else {
            return Ok(ToolOutput::error(
                "Task tool requires a session context to create child sessions",
            ));
        };
        let child = match factory(agent_type) {
            Ok(child) => child,
            Err(e) => return Ok(ToolOutput::error(format!("Failed to create child session: {e}"))),
        };

        // Pipe the child's stream into a buffer that becomes our output.
        let buffer = Arc::new(Mutex::new(String::new()));
        let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let buf = buffer.clone();
        let err = error.clone();
        child.set_callbacks(SessionCallbacks {
            on_stream: Some(Box::new(move |text| {
                buf.lock().unwrap_or_else(|e| e.into_inner()).push_str(text);
            })),
            on_error: Some(Box::new(move |message| {
                *err.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
            })),
            ..Default::default()
        });

        if let Err(e) = child.prompt(prompt).await {
            return Ok(ToolOutput::error(format!("Child session failed: {e}")));
        }

        if let Some(message) = error.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Ok(ToolOutput::error(format!("Error: {message}")));
        }

        let text = buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let text = if text.is_empty() {
            "Task completed with no output".to_string()
        } else {
            text
        };
        Ok(ToolOutput::with_title(text, format!("Task: {description}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn requires_subagent_factory() {
        let out = TaskTool
            .execute(
                json!({"prompt": "do it", "description": "d", "subagent_type": "general"}),
                ToolContext::detached("."),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("session context"));
    }

    #[tokio::test]
    async fn requires_prompt() {
        let out = TaskTool
            .execute(json!({"description": "d"}), ToolContext::detached("."))
            .await
            .unwrap();
        assert!(out.is_error);
    }
}
