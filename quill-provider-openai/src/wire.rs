//! Request Formatting
//!
//! Serializes a `ChatRequest` to the Chat Completions body and parses
//! such a body back into transcript messages. The system prompt is the
//! first `{role:"system"}` element; assistant tool calls ride in
//! `tool_calls` with JSON-string arguments; each tool result is its
//! own `{role:"tool"}` message.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use quill_core::provider::ChatRequest;
use quill_core::tool::input_schema;
use quill_core::types::{ContentPart, Message, Role};

/// Build the JSON body for `POST /v1/chat/completions`.
pub fn build_request_body(request: &ChatRequest) -> Value {
    let mut messages = Vec::new();
    if !request.system_prompt.is_empty() {
        messages.push(json!({"role": "system", "content": request.system_prompt}));
    }
    for message in &request.messages {
        serialize_message(message, &mut messages);
    }

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), json!(messages));
    body.insert("max_tokens".into(), json!(request.max_tokens));
    body.insert("stream".into(), json!(true));
    body.insert("stream_options".into(), json!({"include_usage": true}));
    if let Some(temperature) = request.temperature {
        body.insert("temperature".into(), json!(temperature));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": input_schema(&t.parameters),
                    },
                })
            })
            .collect();
        body.insert("tools".into(), json!(tools));
    }

    Value::Object(body)
}

fn serialize_message(message: &Message, out: &mut Vec<Value>) {
    match message.role {
        Role::System => {
            out.push(json!({"role": "system", "content": message.text()}));
        }
        Role::Assistant => {
            let text = message.text();
            let tool_calls: Vec<Value> = message
                .tool_uses()
                .map(|(id, name, input)| {
                    json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": input.to_string()},
                    })
                })
                .collect();

            let mut entry = Map::new();
            entry.insert("role".into(), json!("assistant"));
            if !text.is_empty() || tool_calls.is_empty() {
                entry.insert("content".into(), json!(text));
            }
            if !tool_calls.is_empty() {
                entry.insert("tool_calls".into(), json!(tool_calls));
            }
            out.push(Value::Object(entry));
        }
        // Tool results become individual role:"tool" messages; any
        // remaining text parts form a plain user message.
        Role::User | Role::Tool => {
            let mut text = String::new();
            for part in &message.parts {
                match part {
                    ContentPart::Text { text: t } => text.push_str(t),
                    ContentPart::ToolResult {
                        tool_use_id,
                        tool_name,
                        content,
                        is_error,
                    } => {
                        let content = if *is_error {
                            format!("Error: {content}")
                        } else {
                            content.clone()
                        };
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "name": tool_name,
                            "content": content,
                        }));
                    }
                    ContentPart::ToolUse { .. } | ContentPart::Image { .. } => {}
                }
            }
            if !text.is_empty() {
                out.push(json!({"role": "user", "content": text}));
            }
        }
    }
}

/// Parse a Chat Completions body back into transcript messages.
/// Consecutive `role:"tool"` entries regroup into one tool-results
/// message, the inverse of serialization; ids and timestamps are
/// regenerated.
pub fn parse_messages(body: &Value) -> Result<Vec<Message>> {
    let Some(entries) = body.get("messages").and_then(|m| m.as_array()) else {
        bail!("body has no messages array");
    };

    let mut messages: Vec<Message> = Vec::new();
    let mut pending_results: Vec<ContentPart> = Vec::new();

    for entry in entries {
        let role = entry.get("role").and_then(|r| r.as_str()).unwrap_or("");

        if role != "tool" && !pending_results.is_empty() {
            messages.push(Message::tool_results(std::mem::take(&mut pending_results)));
        }

        match role {
            "system" => {
                messages.push(Message::system(text_of(entry)));
            }
            "user" => {
                messages.push(Message::user(text_of(entry)));
            }
            "assistant" => {
                let mut parts = Vec::new();
                let text = text_of(entry);
                if !text.is_empty() {
                    parts.push(ContentPart::text(text));
                }
                if let Some(calls) = entry.get("tool_calls").and_then(|t| t.as_array()) {
                    for call in calls {
                        let function = call.get("function").cloned().unwrap_or_default();
                        let arguments = function
                            .get("arguments")
                            .and_then(|a| a.as_str())
                            .unwrap_or("{}");
                        parts.push(ContentPart::ToolUse {
                            id: string_of(call, "id"),
                            name: string_of(&function, "name"),
                            input: serde_json::from_str(arguments).unwrap_or(Value::Null),
                        });
                    }
                }
                messages.push(Message::new(Role::Assistant, parts));
            }
            "tool" => {
                let content = text_of(entry);
                let (content, is_error) = match content.strip_prefix("Error: ") {
                    Some(rest) => (rest.to_string(), true),
                    None => (content, false),
                };
                pending_results.push(ContentPart::ToolResult {
                    tool_use_id: string_of(entry, "tool_call_id"),
                    tool_name: string_of(entry, "name"),
                    content,
                    is_error,
                });
            }
            other => bail!("unexpected role: {other:?}"),
        }
    }

    if !pending_results.is_empty() {
        messages.push(Message::tool_results(pending_results));
    }

    Ok(messages)
}

fn text_of(entry: &Value) -> String {
    entry
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string()
}

fn string_of(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            system_prompt: "You are a helpful assistant.".into(),
            messages,
            tools: vec![],
            max_tokens: 4096,
            temperature: Some(0.7),
        }
    }

    fn logical(messages: &[Message]) -> Vec<(Role, Vec<ContentPart>)> {
        messages
            .iter()
            .map(|m| (m.role, m.parts.clone()))
            .collect()
    }

    #[test]
    fn system_is_first_message() {
        let body = build_request_body(&request(vec![Message::user("Hello")]));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You are a helpful assistant.");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn assistant_tool_calls_are_function_entries() {
        let assistant = Message::assistant(vec![ContentPart::ToolUse {
            id: "call_1".into(),
            name: "read".into(),
            input: json!({"path": "a.rs"}),
        }]);
        let body = build_request_body(&request(vec![assistant]));

        let entry = &body["messages"][1];
        assert_eq!(entry["role"], "assistant");
        let call = &entry["tool_calls"][0];
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "read");
        // Arguments ride as a JSON string, not an object.
        let arguments: Value =
            serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(arguments["path"], "a.rs");
    }

    #[test]
    fn tool_results_are_separate_tool_messages() {
        let results = Message::tool_results(vec![
            ContentPart::ToolResult {
                tool_use_id: "call_1".into(),
                tool_name: "read".into(),
                content: "fn main() {}".into(),
                is_error: false,
            },
            ContentPart::ToolResult {
                tool_use_id: "call_2".into(),
                tool_name: "glob".into(),
                content: "denied".into(),
                is_error: true,
            },
        ]);
        let body = build_request_body(&request(vec![results]));

        let messages = body["messages"].as_array().unwrap();
        // system + two tool messages
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "call_1");
        assert_eq!(messages[2]["tool_call_id"], "call_2");
        assert!(messages[2]["content"].as_str().unwrap().starts_with("Error:"));
    }

    #[test]
    fn round_trip_text_messages() {
        let original = vec![
            Message::user("What does main.rs do?"),
            Message::assistant(vec![ContentPart::text("It prints hello.")]),
        ];
        let mut req = request(original.clone());
        req.system_prompt = String::new();
        let parsed = parse_messages(&build_request_body(&req)).unwrap();
        assert_eq!(logical(&parsed), logical(&original));
    }

    #[test]
    fn round_trip_tool_conversation() {
        let original = vec![
            Message::user("Read a.rs"),
            Message::assistant(vec![
                ContentPart::text("Reading."),
                ContentPart::ToolUse {
                    id: "call_1".into(),
                    name: "read".into(),
                    input: json!({"path": "a.rs"}),
                },
            ]),
            Message::tool_results(vec![ContentPart::ToolResult {
                tool_use_id: "call_1".into(),
                tool_name: "read".into(),
                content: "fn main() {}".into(),
                is_error: false,
            }]),
            Message::assistant(vec![ContentPart::text("It defines main.")]),
        ];

        let mut req = request(original.clone());
        req.system_prompt = String::new();
        let parsed = parse_messages(&build_request_body(&req)).unwrap();
        assert_eq!(logical(&parsed), logical(&original));
    }

    #[test]
    fn round_trip_groups_adjacent_tool_results() {
        let original = vec![
            Message::assistant(vec![
                ContentPart::ToolUse {
                    id: "a".into(),
                    name: "read".into(),
                    input: json!({}),
                },
                ContentPart::ToolUse {
                    id: "b".into(),
                    name: "glob".into(),
                    input: json!({}),
                },
            ]),
            Message::tool_results(vec![
                ContentPart::ToolResult {
                    tool_use_id: "a".into(),
                    tool_name: "read".into(),
                    content: "one".into(),
                    is_error: false,
                },
                ContentPart::ToolResult {
                    tool_use_id: "b".into(),
                    tool_name: "glob".into(),
                    content: "two".into(),
                    is_error: false,
                },
            ]),
        ];

        let mut req = request(original.clone());
        req.system_prompt = String::new();
        let parsed = parse_messages(&build_request_body(&req)).unwrap();
        assert_eq!(logical(&parsed), logical(&original));
    }
}
