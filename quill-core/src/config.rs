//! Configuration
//!
//! TOML-based configuration: default model, provider credentials, agent
//! profile overlays, MCP server definitions, context limits, and loop
//! settings. Includes startup validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::ContextLimits;
use crate::provider::ProviderSettings;
use crate::retry::RetryPolicy;
use crate::types::{AgentProfile, AgentType, Permission};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Model used when an agent profile does not name one.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Provider connection settings, keyed by provider name
    /// ("anthropic", "openai").
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,

    /// Per-agent-type overlays on the builtin profiles.
    #[serde(default)]
    pub agents: HashMap<String, AgentProfileConfig>,

    /// MCP server definitions.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,

    /// Context accounting and truncation limits.
    #[serde(default)]
    pub context: ContextLimits,

    /// Extra directories scanned by the skill discovery collaborator.
    #[serde(default)]
    pub skill_paths: Vec<PathBuf>,

    /// Session loop settings.
    #[serde(default)]
    pub agent: AgentSettings,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            providers: HashMap::new(),
            agents: HashMap::new(),
            mcp_servers: Vec::new(),
            context: ContextLimits::default(),
            skill_paths: Vec::new(),
            agent: AgentSettings::default(),
        }
    }
}

/// Session loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Maximum tool-turn round-trips per user prompt.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_rounds() -> usize {
    100
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent profile overlays
// ---------------------------------------------------------------------------

/// Partial overrides on a builtin agent profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfileConfig {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub default_permission: Option<Permission>,
    pub allowed_tools: Option<Vec<String>>,
    pub denied_tools: Option<Vec<String>>,
    #[serde(default)]
    pub permissions: HashMap<String, Permission>,
}

impl Config {
    /// Resolve the effective profile for an agent type: the builtin
    /// defaults, overlaid with any `[agents.<type>]` section, with the
    /// model falling back to `default_model`.
    pub fn profile_for(&self, agent_type: AgentType) -> AgentProfile {
        let mut profile = AgentProfile::for_type(agent_type);
        profile.model = self.default_model.clone();

        if let Some(overlay) = self.agents.get(agent_type.as_str()) {
            if let Some(ref model) = overlay.model {
                profile.model = model.clone();
            }
            if overlay.system_prompt.is_some() {
                profile.system_prompt = overlay.system_prompt.clone();
            }
            if let Some(max_tokens) = overlay.max_tokens {
                profile.max_tokens = max_tokens;
            }
            if let Some(default_permission) = overlay.default_permission {
                profile.default_permission = default_permission;
            }
            if let Some(ref allowed) = overlay.allowed_tools {
                profile.allowed_tools = allowed.clone();
            }
            if let Some(ref denied) = overlay.denied_tools {
                profile.denied_tools = denied.clone();
            }
            for (tool, permission) in &overlay.permissions {
                profile.permissions.insert(tool.clone(), *permission);
            }
        }

        profile
    }
}

// ---------------------------------------------------------------------------
// MCP server config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: McpServerKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum McpServerKind {
    /// Local child process speaking framed JSON-RPC over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote server speaking JSON-RPC over HTTP POST.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

// ---------------------------------------------------------------------------
// Loading and paths
// ---------------------------------------------------------------------------

impl Config {
    /// Per-user config directory (`~/.config/quill` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let base = dirs::config_dir().context("could not determine config directory")?;
        Ok(base.join("quill"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Where session records are persisted.
    pub fn sessions_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("sessions"))
    }

    /// Load from the default location, falling back to defaults when
    /// no config file exists.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            return Self::load_from(&path);
        }
        tracing::warn!(
            "no config file at {} — using defaults. Run `quill config init` to create one, \
             or set ANTHROPIC_API_KEY / OPENAI_API_KEY.",
            path.display()
        );
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        info!(path = %path.display(), model = %config.default_model, "loaded config");
        Ok(config)
    }

    /// Resolve the API key for a provider: config first, then the
    /// provider's environment variable.
    pub fn resolve_api_key(&self, provider_name: &str) -> Option<String> {
        if let Some(key) = self
            .providers
            .get(provider_name)
            .and_then(|p| p.api_key.clone())
        {
            return Some(key);
        }

        let env_var = match provider_name {
            "anthropic" => "ANTHROPIC_API_KEY",
            "openai" => "OPENAI_API_KEY",
            _ => return None,
        };
        std::env::var(env_var).ok()
    }

    /// Which provider serves a model id.
    pub fn provider_for_model(model: &str) -> &'static str {
        if model.starts_with("claude") {
            "anthropic"
        } else {
            "openai"
        }
    }

    /// Validate on startup. Hard errors for unusable configs, warnings
    /// for recoverable problems.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        let provider = Self::provider_for_model(&self.default_model);
        if self.resolve_api_key(provider).is_none() {
            let env_var = match provider {
                "anthropic" => "ANTHROPIC_API_KEY",
                _ => "OPENAI_API_KEY",
            };
            bail!(
                "no API key for provider '{}'. Set {} or add api_key under [providers.{}] in {}",
                provider,
                env_var,
                provider,
                Self::default_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "<unknown>".into()),
            );
        }

        for server in &self.mcp_servers {
            if !server.enabled {
                continue;
            }
            if let McpServerKind::Stdio { ref command, .. } = server.kind {
                if which::which(command).is_err() {
                    warnings.push(format!(
                        "MCP server '{}': command '{}' not found on PATH",
                        server.name, command
                    ));
                }
            }
        }

        Ok(warnings)
    }
}

/// Generate a sample config TOML string for `quill config init`.
pub fn sample_config() -> String {
    r#"# Quill configuration

# Model used when an agent profile does not name one.
default_model = "claude-sonnet-4-20250514"

[providers.anthropic]
# api_key = "sk-ant-..."  # Or set ANTHROPIC_API_KEY
# base_url = "https://api.anthropic.com"

[providers.openai]
# api_key = "sk-..."  # Or set OPENAI_API_KEY
# base_url = "https://api.openai.com"

# Per-agent-type overrides
# [agents.build]
# model = "claude-opus-4-20250514"
# default_permission = "ask"
#
# [agents.explore]
# denied_tools = ["write", "edit", "bash"]

# MCP servers — external tools the agent can use
# [[mcp_servers]]
# name = "filesystem"
# kind = "stdio"
# command = "mcp-server-filesystem"
# args = ["/workspace"]
#
# [[mcp_servers]]
# name = "search"
# kind = "http"
# url = "https://mcp.example.com/rpc"

[context]
prune_protect_tokens = 40000
prune_minimum_tokens = 20000
truncate_max_lines = 1000
truncate_max_bytes = 50000

[agent]
max_rounds = 100

[agent.retry]
max_retries = 3
base_delay_ms = 1000
max_delay_ms = 30000
backoff_multiplier = 2.0
"#
    .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
