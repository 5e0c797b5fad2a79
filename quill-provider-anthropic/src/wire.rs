//! Request Formatting
//!
//! Serializes a `ChatRequest` to the Anthropic Messages body and
//! parses such a body back into transcript messages. The system prompt
//! is a top-level string; a message with a single text part serializes
//! as a bare content string, anything else as an array of typed
//! blocks. Tool results live inside user messages.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use quill_core::provider::ChatRequest;
use quill_core::tool::input_schema;
use quill_core::types::{ContentPart, Message, Role};

/// Build the JSON body for `POST /v1/messages`.
pub fn build_request_body(request: &ChatRequest) -> Value {
    let mut messages = Vec::new();
    for message in &request.messages {
        let role = match message.role {
            Role::Assistant => "assistant",
            // System interjections mid-transcript have no role of
            // their own in this dialect; the model sees them as user
            // text. Tool results already live in user messages.
            Role::User | Role::System | Role::Tool => "user",
        };
        messages.push(json!({
            "role": role,
            "content": serialize_content(message),
        }));
    }

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("max_tokens".into(), json!(request.max_tokens));
    body.insert("stream".into(), json!(true));
    body.insert("messages".into(), json!(messages));
    if !request.system_prompt.is_empty() {
        body.insert("system".into(), json!(request.system_prompt));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".into(), json!(temperature));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": input_schema(&t.parameters),
                })
            })
            .collect();
        body.insert("tools".into(), json!(tools));
    }

    Value::Object(body)
}

fn serialize_content(message: &Message) -> Value {
    if message.is_plain_text() {
        return json!(message.text());
    }

    let blocks: Vec<Value> = message
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"type": "text", "text": text}),
            ContentPart::ToolUse { id, name, input } => json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            ContentPart::ToolResult {
                tool_use_id,
                tool_name,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "tool_name": tool_name,
                "content": content,
                "is_error": is_error,
            }),
            ContentPart::Image { media_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            }),
        })
        .collect();
    json!(blocks)
}

/// Parse a Messages-dialect body back into transcript messages.
/// Message ids and timestamps are regenerated; the logical (role,
/// parts) sequence is preserved.
pub fn parse_messages(body: &Value) -> Result<Vec<Message>> {
    let Some(entries) = body.get("messages").and_then(|m| m.as_array()) else {
        bail!("body has no messages array");
    };

    let mut messages = Vec::new();
    for entry in entries {
        let role = match entry.get("role").and_then(|r| r.as_str()) {
            Some("user") => Role::User,
            Some("assistant") => Role::Assistant,
            other => bail!("unexpected role: {other:?}"),
        };

        let parts = match entry.get("content") {
            Some(Value::String(text)) => vec![ContentPart::text(text.clone())],
            Some(Value::Array(blocks)) => blocks.iter().map(parse_block).collect::<Result<_>>()?,
            other => bail!("unexpected content: {other:?}"),
        };

        messages.push(Message::new(role, parts));
    }
    Ok(messages)
}

fn parse_block(block: &Value) -> Result<ContentPart> {
    match block.get("type").and_then(|t| t.as_str()) {
        Some("text") => Ok(ContentPart::text(
            block.get("text").and_then(|t| t.as_str()).unwrap_or(""),
        )),
        Some("tool_use") => Ok(ContentPart::ToolUse {
            id: string_of(block, "id"),
            name: string_of(block, "name"),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        Some("tool_result") => Ok(ContentPart::ToolResult {
            tool_use_id: string_of(block, "tool_use_id"),
            tool_name: string_of(block, "tool_name"),
            content: string_of(block, "content"),
            is_error: block
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }),
        Some("image") => {
            let source = block.get("source").cloned().unwrap_or_default();
            Ok(ContentPart::Image {
                media_type: string_of(&source, "media_type"),
                data: string_of(&source, "data"),
            })
        }
        other => bail!("unexpected content block type: {other:?}"),
    }
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
    use quill_core::provider::ToolSpec;
    use quill_core::tool::{ParamKind, ParameterSchema};

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet-4-20250514".into(),
            system_prompt: "You are a helpful assistant.".into(),
            messages,
            tools: vec![],
            max_tokens: 4096,
            temperature: None,
        }
    }

    fn logical(messages: &[Message]) -> Vec<(Role, Vec<ContentPart>)> {
        messages
            .iter()
            .map(|m| (m.role, m.parts.clone()))
            .collect()
    }

    #[test]
    fn system_is_top_level() {
        let body = build_request_body(&request(vec![Message::user("Hello")]));
        assert_eq!(body["system"], "You are a helpful assistant.");
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn single_text_part_is_bare_string() {
        let body = build_request_body(&request(vec![Message::user("Hello")]));
        assert_eq!(body["messages"][0]["content"], "Hello");
    }

    #[test]
    fn mixed_parts_become_blocks() {
        let assistant = Message::assistant(vec![
            ContentPart::text("Let me check."),
            ContentPart::ToolUse {
                id: "t1".into(),
                name: "read".into(),
                input: json!({"path": "a.rs"}),
            },
        ]);
        let body = build_request_body(&request(vec![assistant]));

        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "tool_use");
        assert_eq!(content[1]["id"], "t1");
        assert_eq!(content[1]["input"]["path"], "a.rs");
    }

    #[test]
    fn tool_results_live_in_user_messages() {
        let results = Message::tool_results(vec![ContentPart::ToolResult {
            tool_use_id: "t1".into(),
            tool_name: "read".into(),
            content: "fn main() {}".into(),
            is_error: false,
        }]);
        let body = build_request_body(&request(vec![results]));

        assert_eq!(body["messages"][0]["role"], "user");
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "tool_result");
        assert_eq!(content[0]["tool_use_id"], "t1");
    }

    #[test]
    fn tools_render_input_schemas() {
        let mut req = request(vec![Message::user("hi")]);
        req.tools = vec![ToolSpec {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: vec![ParameterSchema::required(
                "msg",
                ParamKind::String,
                "Message",
            )],
        }];
        let body = build_request_body(&req);

        assert_eq!(body["tools"][0]["name"], "echo");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(
            body["tools"][0]["input_schema"]["properties"]["msg"]["type"],
            "string"
        );
    }

    #[test]
    fn round_trip_text_messages() {
        let original = vec![
            Message::user("What does main.rs do?"),
            Message::assistant(vec![ContentPart::text("It prints hello.")]),
        ];
        let body = build_request_body(&request(original.clone()));
        let parsed = parse_messages(&body).unwrap();
        assert_eq!(logical(&parsed), logical(&original));
    }

    #[test]
    fn round_trip_tool_conversation() {
        let original = vec![
            Message::user("Read a.rs"),
            Message::assistant(vec![
                ContentPart::text("Reading."),
                ContentPart::ToolUse {
                    id: "t1".into(),
                    name: "read".into(),
                    input: json!({"path": "a.rs"}),
                },
            ]),
            Message::tool_results(vec![ContentPart::ToolResult {
                tool_use_id: "t1".into(),
                tool_name: "read".into(),
                content: "fn main() {}".into(),
                is_error: false,
            }]),
            Message::assistant(vec![ContentPart::text("It defines main.")]),
        ];

        let body = build_request_body(&request(original.clone()));
        let parsed = parse_messages(&body).unwrap();
        assert_eq!(logical(&parsed), logical(&original));
    }
}
