//! Tool System
//!
//! The `Tool` capability trait, parameter schemas, execution context,
//! and the registry that the session engine resolves tool calls
//! against. Builtin implementations live in `crate::tools`; MCP tools
//! are bridged in through `crate::mcp`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::provider::ToolSpec;
use crate::session::Session;
use crate::types::AgentType;

// ---------------------------------------------------------------------------
// Parameter schemas
// ---------------------------------------------------------------------------

/// JSON-Schema primitive parameter types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
        }
    }

    /// Parse a JSON-Schema type name. Unknown names map to `String`.
    pub fn parse(s: &str) -> Self {
        match s {
            "number" | "integer" => ParamKind::Number,
            "boolean" => ParamKind::Boolean,
            "array" => ParamKind::Array,
            "object" => ParamKind::Object,
            _ => ParamKind::String,
        }
    }
}

/// One declared tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSchema {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub enum_values: Option<Vec<String>>,
}

impl ParameterSchema {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: true,
            default: None,
            enum_values: None,
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// Render a parameter list as a JSON-Schema `input_schema` object.
pub fn input_schema(params: &[ParameterSchema]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for p in params {
        let mut prop = serde_json::Map::new();
        prop.insert("type".into(), json!(p.kind.as_str()));
        if !p.description.is_empty() {
            prop.insert("description".into(), json!(p.description));
        }
        if let Some(ref default) = p.default {
            prop.insert("default".into(), default.clone());
        }
        if let Some(ref values) = p.enum_values {
            prop.insert("enum".into(), json!(values));
        }
        properties.insert(p.name.clone(), Value::Object(prop));
        if p.required {
            required.push(p.name.clone());
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ---------------------------------------------------------------------------
// Tool output
// ---------------------------------------------------------------------------

/// The result of one tool execution. Large outputs are the tool's
/// responsibility to truncate; the engine may truncate further for the
/// transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub title: Option<String>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            title: None,
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            title: None,
            is_error: true,
        }
    }

    pub fn with_title(content: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            title: Some(title.into()),
            is_error: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Questions a tool wants to put to the user.
#[derive(Debug, Clone, Default)]
pub struct QuestionRequest {
    pub questions: Vec<String>,
}

/// The user's answers, in question order.
#[derive(Debug, Clone, Default)]
pub struct QuestionResponse {
    pub answers: Vec<String>,
    pub cancelled: bool,
}

/// Callback that asks the user the given questions. Supplied by the UI.
pub type QuestionHandler =
    Arc<dyn Fn(QuestionRequest) -> BoxFuture<'static, Result<QuestionResponse>> + Send + Sync>;

/// Factory that creates a child session of the given agent type, with
/// a fresh transcript and a cancellation token derived from the
/// invoking tool's context. Supplied by the owning session.
pub type SubagentFactory = Arc<dyn Fn(AgentType) -> Result<Arc<Session>> + Send + Sync>;

/// Everything a tool execution may need from its surroundings.
#[derive(Clone)]
pub struct ToolContext {
    /// The owning session.
    pub session_id: String,
    /// The assistant message that requested this call.
    pub message_id: String,
    pub working_dir: PathBuf,
    /// Cooperative cancellation. Tools poll this at coarse granularity.
    pub cancel: CancellationToken,
    /// User interaction, when a UI is attached.
    pub question_handler: Option<QuestionHandler>,
    /// Child-session creation, for delegation tools.
    pub subagents: Option<SubagentFactory>,
}

impl ToolContext {
    /// A bare context for direct tool invocation (tests, scripts).
    pub fn detached(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: String::new(),
            message_id: String::new(),
            working_dir: working_dir.into(),
            cancel: CancellationToken::new(),
            question_handler: None,
            subagents: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A capability the model can invoke. Implementations must be safe to
/// call concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable identifier, used in permission keys. MCP tools are
    /// namespaced `mcp_<server>_<name>`.
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> Vec<ParameterSchema>;

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds the tools available to sessions. Explicitly constructed and
/// shared behind an `Arc`; lookups take a short read lock.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its id. Replaces any existing tool with
    /// the same id.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let id = tool.id().to_string();
        tracing::debug!(tool = %id, "registered tool");
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tool);
    }

    /// Remove a tool. Returns true if it was present.
    pub fn unregister(&self, id: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// All registered tool ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Specs for every registered tool, sorted by name, for inclusion
    /// in a model request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut specs: Vec<ToolSpec> = tools
            .values()
            .map(|t| ToolSpec {
                name: t.id().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
