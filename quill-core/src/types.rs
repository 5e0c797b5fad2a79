//! Core Types
//!
//! The message model (roles, content parts, transcript messages),
//! token accounting, finish reasons, agent types, and per-agent
//! permission profiles.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Roles and content parts
// ---------------------------------------------------------------------------

/// Message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One part of a message's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// A tool invocation requested by the model.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// The result of a tool invocation, paired by `tool_use_id`.
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
    /// An inline image (URL or base64 payload).
    Image { media_type: String, data: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message in the transcript. Immutable once committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    /// A user message carrying only tool results.
    pub fn tool_results(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::User, parts)
    }

    /// Concatenated text of all `Text` parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Iterate the `ToolUse` parts of this message.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    /// True if the message consists of exactly one `Text` part.
    pub fn is_plain_text(&self) -> bool {
        self.parts.len() == 1 && matches!(self.parts[0], ContentPart::Text { .. })
    }
}

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

/// Token usage for one model call. Additive across turns.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            cache_read: 0,
            cache_write: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
        self.cache_read += rhs.cache_read;
        self.cache_write += rhs.cache_write;
    }
}

// ---------------------------------------------------------------------------
// Finish reasons
// ---------------------------------------------------------------------------

/// Why a model stream finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::Error => "error",
            FinishReason::Cancelled => "cancelled",
        }
    }

    /// Parse a finish reason, normalizing provider-specific aliases.
    /// Unknown strings map to `Stop`.
    pub fn parse(s: &str) -> Self {
        match s {
            "stop" | "end_turn" | "stop_sequence" => FinishReason::Stop,
            "tool_calls" | "tool_use" => FinishReason::ToolCalls,
            "length" | "max_tokens" => FinishReason::Length,
            "error" => FinishReason::Error,
            "cancelled" => FinishReason::Cancelled,
            _ => FinishReason::Stop,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent types and permissions
// ---------------------------------------------------------------------------

/// The kind of agent driving a session. Determines the default
/// permission posture and toolset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Build,
    Explore,
    General,
    Plan,
    Compaction,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Build => "build",
            AgentType::Explore => "explore",
            AgentType::General => "general",
            AgentType::Plan => "plan",
            AgentType::Compaction => "compaction",
        }
    }

    /// Parse an agent type. Unknown strings map to `Build`.
    pub fn parse(s: &str) -> Self {
        match s {
            "build" => AgentType::Build,
            "explore" => AgentType::Explore,
            "general" => AgentType::General,
            "plan" => AgentType::Plan,
            "compaction" => AgentType::Compaction,
            _ => AgentType::Build,
        }
    }
}

/// A permission verdict for a tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Allow,
    Ask,
    Deny,
}

/// Per-agent configuration: model, prompt, and permission posture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_type: AgentType,
    pub model: String,
    /// Extra system prompt text appended to the agent-type prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub default_permission: Permission,
    /// Whitelist: when non-empty, only these tools may run.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Blacklist: these tools never run.
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Explicit per-tool overrides.
    #[serde(default)]
    pub permissions: HashMap<String, Permission>,
}

impl AgentProfile {
    /// The default profile for an agent type.
    pub fn for_type(agent_type: AgentType) -> Self {
        let base = Self {
            agent_type,
            model: String::new(),
            system_prompt: None,
            max_tokens: 8192,
            default_permission: Permission::Ask,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            permissions: HashMap::new(),
        };
        match agent_type {
            // Full toolset, user confirms by default.
            AgentType::Build => base,
            // Read-only explorer: everything allowed except mutation.
            AgentType::Explore => Self {
                default_permission: Permission::Allow,
                denied_tools: vec!["write".into(), "edit".into(), "bash".into()],
                ..base
            },
            AgentType::General => base,
            // Planning: only the read subset.
            AgentType::Plan => Self {
                default_permission: Permission::Deny,
                allowed_tools: vec!["read".into(), "glob".into(), "grep".into()],
                ..base
            },
            // Compaction runs with no tools at all.
            AgentType::Compaction => Self {
                default_permission: Permission::Deny,
                allowed_tools: vec!["__none__".into()],
                ..base
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_and_accumulation() {
        let mut a = TokenUsage {
            input: 100,
            output: 50,
            cache_read: 30,
            cache_write: 20,
        };
        assert_eq!(a.total(), 150);

        a += TokenUsage {
            input: 200,
            output: 100,
            cache_read: 10,
            cache_write: 5,
        };
        assert_eq!(a.input, 300);
        assert_eq!(a.output, 150);
        assert_eq!(a.cache_read, 40);
        assert_eq!(a.cache_write, 25);
        assert_eq!(a.total(), 450);
    }

    #[test]
    fn finish_reason_round_trip() {
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::parse("length"), FinishReason::Length);
        assert_eq!(FinishReason::parse("error"), FinishReason::Error);
        assert_eq!(FinishReason::parse("cancelled"), FinishReason::Cancelled);
    }

    #[test]
    fn finish_reason_aliases() {
        assert_eq!(FinishReason::parse("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("tool_use"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::parse("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::parse("some_new_value"), FinishReason::Stop);
    }

    #[test]
    fn agent_type_round_trip() {
        for ty in [
            AgentType::Build,
            AgentType::Explore,
            AgentType::General,
            AgentType::Plan,
            AgentType::Compaction,
        ] {
            assert_eq!(AgentType::parse(ty.as_str()), ty);
        }
        assert_eq!(AgentType::parse("nonexistent"), AgentType::Build);
    }

    #[test]
    fn explore_profile_is_read_only() {
        let profile = AgentProfile::for_type(AgentType::Explore);
        assert_eq!(profile.default_permission, Permission::Allow);
        assert!(profile.denied_tools.contains(&"write".to_string()));
        assert!(profile.denied_tools.contains(&"edit".to_string()));
        assert!(profile.denied_tools.contains(&"bash".to_string()));
    }

    #[test]
    fn plan_profile_allows_read_subset() {
        let profile = AgentProfile::for_type(AgentType::Plan);
        assert_eq!(profile.default_permission, Permission::Deny);
        assert_eq!(profile.allowed_tools, vec!["read", "glob", "grep"]);
    }

    #[test]
    fn message_text_concatenates_parts() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentPart::text("Hello "),
                ContentPart::ToolUse {
                    id: "t1".into(),
                    name: "read".into(),
                    input: serde_json::json!({"path": "x"}),
                },
                ContentPart::text("world"),
            ],
        );
        assert_eq!(msg.text(), "Hello world");
        assert_eq!(msg.tool_uses().count(), 1);
        assert!(!msg.is_plain_text());
    }

    #[test]
    fn message_serde_round_trip() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentPart::text("hi"),
                ContentPart::ToolResult {
                    tool_use_id: "t1".into(),
                    tool_name: "read".into(),
                    content: "ok".into(),
                    is_error: false,
                },
            ],
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
