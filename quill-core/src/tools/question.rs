//! Question Tool

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::tool::{
    ParamKind, ParameterSchema, QuestionRequest, Tool, ToolContext, ToolOutput,
};

pub struct QuestionTool;

#[async_trait]
impl Tool for QuestionTool {
    fn id(&self) -> &str {
        "question"
    }

    fn description(&self) -> &str {
        "Ask the user one or more questions to gather information or clarify requirements."
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![ParameterSchema::required(
            "questions",
            ParamKind::Array,
            "Array of questions to ask the user (strings)",
        )]
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let questions: Vec<String> = args
            .get("questions")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|q| {
                        // Accept bare strings or {question: "..."} objects.
                        q.as_str()
                            .or_else(|| q.get("question").and_then(|v| v.as_str()))
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();

        if questions.is_empty() {
            return Ok(ToolOutput::error("No questions provided"));
        }

        let Some(handler) = ctx.question_handler else {
            // Non-interactive mode: surface the questions as an error
            // so the model knows they went unanswered.
            warn!("question tool: no question handler attached");
            let mut out = String::from("Questions for user (no interactive handler available):\n");
            for (i, q) in questions.iter().enumerate() {
                out.push_str(&format!("\n{}. {}", i + 1, q));
            }
            return Ok(ToolOutput::error(out));
        };

        let response = handler(QuestionRequest {
            questions: questions.clone(),
        })
        .await?;

        if response.cancelled {
            return Ok(ToolOutput::error("User cancelled the question"));
        }

        let mut out = String::from("User responses:\n");
        for (i, (question, answer)) in questions.iter().zip(response.answers.iter()).enumerate() {
            out.push_str(&format!("\nQ{}: {}\nA{}: {}\n", i + 1, question, i + 1, answer));
        }
        Ok(ToolOutput::success(out))
    }
}
