//! SSE Parsing
//!
//! State machine over the Chat Completions streaming protocol. Deltas
//! arrive under `choices[0].delta`; tool-call fragments accumulate per
//! index until the finish_reason chunk, after which each assembled
//! call is emitted followed by the finish event at `[DONE]`.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use quill_core::stream::StreamEvent;
use quill_core::types::{FinishReason, TokenUsage};

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental parser for one Chat Completions SSE stream.
#[derive(Default)]
pub struct SseParser {
    /// Tool calls keyed by their delta index, in index order.
    calls: BTreeMap<u64, ToolCallAccumulator>,
    finish_reason: Option<FinishReason>,
    usage: TokenUsage,
    /// Assembled calls flushed at finish_reason, waiting for [DONE].
    flushed: bool,
    broken: Option<String>,
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one SSE line.
    pub fn feed(&mut self, line: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return Vec::new();
        };

        if data == "[DONE]" {
            return match self.finalize() {
                Some(event) => vec![event],
                None => {
                    self.finished = true;
                    vec![StreamEvent::StreamError {
                        message: "stream closed without a finish reason".into(),
                        retryable: true,
                    }]
                }
            };
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(err = %e, "malformed SSE data line");
                self.finished = true;
                return vec![StreamEvent::StreamError {
                    message: format!("malformed SSE frame: {e}"),
                    retryable: false,
                }];
            }
        };

        // Error payloads come as {"error": {...}} chunks.
        if let Some(error) = chunk.get("error") {
            self.finished = true;
            return vec![StreamEvent::StreamError {
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
                retryable: false,
            }];
        }

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage.input = usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.usage.output = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.usage.cache_read = usage
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return Vec::new();
        };

        let mut events = Vec::new();

        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                if !content.is_empty() {
                    events.push(StreamEvent::TextDelta(content.to_string()));
                }
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for fragment in tool_calls {
                    let index = fragment.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let entry = self.calls.entry(index).or_default();

                    if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
                        entry.id = id.to_string();
                    }
                    let function = fragment.get("function");
                    if let Some(name) =
                        function.and_then(|f| f.get("name")).and_then(|v| v.as_str())
                    {
                        entry.name.push_str(name);
                    }
                    if let Some(arguments) = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(|v| v.as_str())
                    {
                        entry.arguments.push_str(arguments);
                        events.push(StreamEvent::ToolCallDelta {
                            id: entry.id.clone(),
                            name: entry.name.clone(),
                            arguments_delta: arguments.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.finish_reason = Some(FinishReason::parse(reason));
            events.extend(self.flush_calls());
        }

        events
    }

    /// Emit one `ToolCallComplete` per accumulated call, in index
    /// order.
    fn flush_calls(&mut self) -> Vec<StreamEvent> {
        if self.flushed {
            return Vec::new();
        }
        self.flushed = true;

        let mut events = Vec::new();
        for (_, call) in std::mem::take(&mut self.calls) {
            let arguments = if call.arguments.is_empty() {
                Ok(serde_json::json!({}))
            } else {
                serde_json::from_str::<Value>(&call.arguments)
            };
            match arguments {
                Ok(arguments) => events.push(StreamEvent::ToolCallComplete {
                    id: call.id,
                    name: call.name,
                    arguments,
                }),
                Err(e) => {
                    self.broken = Some(format!(
                        "tool call '{}' arguments never completed: {e}",
                        call.name
                    ));
                }
            }
        }
        events
    }

    /// Produce the terminal event once the finish_reason is known.
    /// Called at `[DONE]`, or by the reader when the connection closes
    /// without one.
    pub fn finalize(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        if let Some(message) = self.broken.take() {
            self.finished = true;
            return Some(StreamEvent::StreamError {
                message,
                retryable: false,
            });
        }
        let reason = self.finish_reason?;
        self.finished = true;
        Some(StreamEvent::FinishStep {
            reason,
            usage: self.usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut SseParser, lines: &[&str]) -> Vec<StreamEvent> {
        lines.iter().flat_map(|l| parser.feed(l)).collect()
    }

    #[test]
    fn plain_text_stream() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"Hello "}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"world"}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
                "data: [DONE]",
            ],
        );

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hello ".into()),
                StreamEvent::TextDelta("world".into()),
                StreamEvent::FinishStep {
                    reason: FinishReason::Stop,
                    usage: TokenUsage::new(10, 5),
                },
            ]
        );
        assert!(parser.is_finished());
    }

    #[test]
    fn tool_call_fragments_accumulate() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read","arguments":""}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"a.rs\"}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );

        let complete = events
            .iter()
            .find(|e| matches!(e, StreamEvent::ToolCallComplete { .. }))
            .unwrap();
        assert_eq!(
            *complete,
            StreamEvent::ToolCallComplete {
                id: "call_1".into(),
                name: "read".into(),
                arguments: serde_json::json!({"path": "a.rs"}),
            }
        );
        assert!(matches!(
            events.last(),
            Some(StreamEvent::FinishStep {
                reason: FinishReason::ToolCalls,
                ..
            })
        ));
    }

    #[test]
    fn multiple_calls_flushed_in_index_order() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"glob","arguments":"{}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"read","arguments":"{}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );

        let ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallComplete { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn length_finish_reason_normalized() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#,
                "data: [DONE]",
            ],
        );
        assert!(matches!(
            events.last(),
            Some(StreamEvent::FinishStep {
                reason: FinishReason::Length,
                ..
            })
        ));
    }

    #[test]
    fn cached_tokens_captured() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":100,"completion_tokens":7,"prompt_tokens_details":{"cached_tokens":60}}}"#,
                "data: [DONE]",
            ],
        );
        match events.last() {
            Some(StreamEvent::FinishStep { usage, .. }) => {
                assert_eq!(usage.input, 100);
                assert_eq!(usage.cache_read, 60);
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn broken_arguments_error_instead_of_finish() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"t","function":{"name":"read","arguments":"{\"path\":"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );
        assert!(matches!(
            events.last(),
            Some(StreamEvent::StreamError { retryable: false, .. })
        ));
    }

    #[test]
    fn error_chunk_terminates() {
        let mut parser = SseParser::new();
        let events =
            parser.feed(r#"data: {"error":{"message":"Invalid API key","type":"auth_error"}}"#);
        assert_eq!(
            events,
            vec![StreamEvent::StreamError {
                message: "Invalid API key".into(),
                retryable: false,
            }]
        );
    }

    #[test]
    fn finalize_without_done_uses_finish_reason() {
        let mut parser = SseParser::new();
        parser.feed(r#"data: {"choices":[{"delta":{"content":"x"}}]}"#);
        parser.feed(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        assert!(!parser.is_finished());
        assert!(matches!(
            parser.finalize(),
            Some(StreamEvent::FinishStep { .. })
        ));
        assert!(parser.is_finished());
    }
}
