//! SSE Parsing
//!
//! State machine over the Anthropic Messages streaming protocol. Fed
//! one line at a time (`event:` / `data:` lines separated by blanks),
//! it emits the tagged stream events the session engine consumes.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use quill_core::stream::StreamEvent;
use quill_core::types::{FinishReason, TokenUsage};

/// One in-flight tool_use content block.
struct ToolBlock {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental parser for one Anthropic SSE stream.
///
/// Per-stream state: open tool_use blocks keyed by content-block
/// index with their accumulated argument JSON, the pending stop
/// reason, and usage gathered from `message_start` / `message_delta`.
#[derive(Default)]
pub struct SseParser {
    blocks: HashMap<u64, ToolBlock>,
    stop_reason: Option<FinishReason>,
    usage: TokenUsage,
    /// Set when accumulated tool arguments failed to parse; reported
    /// as a stream error instead of a finish event.
    broken: Option<String>,
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal event (`FinishStep` / `StreamError`) was
    /// emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one SSE line. Blank lines and `event:` lines carry no
    /// payload; `data:` lines are parsed and translated.
    pub fn feed(&mut self, line: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return Vec::new();
        };

        let event: Value = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                warn!(err = %e, "malformed SSE data line");
                self.finished = true;
                return vec![StreamEvent::StreamError {
                    message: format!("malformed SSE frame: {e}"),
                    retryable: false,
                }];
            }
        };

        match event.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "message_start" => {
                if let Some(usage) = event.get("message").and_then(|m| m.get("usage")) {
                    self.usage.input = u64_field(usage, "input_tokens");
                    self.usage.cache_read = u64_field(usage, "cache_read_input_tokens");
                    self.usage.cache_write = u64_field(usage, "cache_creation_input_tokens");
                }
                Vec::new()
            }
            "content_block_start" => {
                let index = u64_field(&event, "index");
                if let Some(block) = event.get("content_block") {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        self.blocks.insert(
                            index,
                            ToolBlock {
                                id: str_field(block, "id"),
                                name: str_field(block, "name"),
                                arguments: String::new(),
                            },
                        );
                    }
                }
                Vec::new()
            }
            "content_block_delta" => {
                let index = u64_field(&event, "index");
                let Some(delta) = event.get("delta") else {
                    return Vec::new();
                };
                match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text_delta" => match delta.get("text").and_then(|t| t.as_str()) {
                        Some(text) if !text.is_empty() => {
                            vec![StreamEvent::TextDelta(text.to_string())]
                        }
                        _ => Vec::new(),
                    },
                    "input_json_delta" => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(|p| p.as_str())
                            .unwrap_or("");
                        if let Some(block) = self.blocks.get_mut(&index) {
                            block.arguments.push_str(partial);
                            vec![StreamEvent::ToolCallDelta {
                                id: block.id.clone(),
                                name: block.name.clone(),
                                arguments_delta: partial.to_string(),
                            }]
                        } else {
                            Vec::new()
                        }
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let index = u64_field(&event, "index");
                let Some(block) = self.blocks.remove(&index) else {
                    return Vec::new();
                };
                // No deltas at all means a tool with no arguments.
                let arguments = if block.arguments.is_empty() {
                    Ok(json!({}))
                } else {
                    serde_json::from_str::<Value>(&block.arguments)
                };
                match arguments {
                    Ok(arguments) => vec![StreamEvent::ToolCallComplete {
                        id: block.id,
                        name: block.name,
                        arguments,
                    }],
                    Err(e) => {
                        // Reported at stream end, per contract.
                        self.broken = Some(format!(
                            "tool call '{}' arguments never completed: {e}",
                            block.name
                        ));
                        Vec::new()
                    }
                }
            }
            "message_delta" => {
                if let Some(reason) = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|s| s.as_str())
                {
                    self.stop_reason = Some(FinishReason::parse(reason));
                }
                if let Some(usage) = event.get("usage") {
                    self.usage.output = u64_field(usage, "output_tokens");
                }
                Vec::new()
            }
            "message_stop" => {
                self.finished = true;
                if let Some(message) = self.broken.take() {
                    return vec![StreamEvent::StreamError {
                        message,
                        retryable: false,
                    }];
                }
                vec![StreamEvent::FinishStep {
                    reason: self.stop_reason.unwrap_or(FinishReason::Stop),
                    usage: self.usage,
                }]
            }
            "error" => {
                self.finished = true;
                let error_type = event
                    .get("error")
                    .and_then(|e| e.get("type"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                let message = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error");
                vec![StreamEvent::StreamError {
                    message: message.to_string(),
                    retryable: matches!(error_type, "overloaded_error" | "rate_limit_error"),
                }]
            }
            "ping" => Vec::new(),
            other => {
                debug!(event_type = other, "unhandled Anthropic SSE event");
                Vec::new()
            }
        }
    }
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
