//! LLM Provider Trait
//!
//! Defines the `Provider` trait implemented by each model backend
//! (Anthropic-style and OpenAI-style adapters live in their own
//! crates), plus the request and model-catalog types.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::stream::EventStream;
use crate::tool::ParameterSchema;
use crate::types::Message;

// ---------------------------------------------------------------------------
// Model catalog
// ---------------------------------------------------------------------------

/// Metadata for a model offered by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier (e.g. "claude-sonnet-4-20250514").
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Owning provider name.
    pub provider: String,
    /// Maximum input context tokens.
    pub context_window: u32,
    /// Maximum output tokens per response.
    pub max_output_tokens: u32,
    pub supports_tools: bool,
    pub supports_vision: bool,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A tool advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSchema>,
}

/// One streaming completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

/// Connection settings for one provider, from config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// API key. When absent the provider's env var is consulted.
    pub api_key: Option<String>,
    /// Custom base URL (for compatible endpoints).
    pub base_url: Option<String>,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// A streaming model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier (e.g. "anthropic", "openai").
    fn name(&self) -> &str;

    /// The models this provider offers.
    fn models(&self) -> Vec<ModelInfo>;

    /// Look up one model by id.
    fn get_model(&self, id: &str) -> Option<ModelInfo> {
        self.models().into_iter().find(|m| m.id == id)
    }

    /// Open a streaming completion. Returns the event stream; the
    /// producer task ends after `FinishStep`/`StreamError`, or when
    /// the receiver is dropped.
    async fn stream(&self, request: &ChatRequest) -> Result<EventStream>;
}
