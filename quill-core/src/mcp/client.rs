//! MCP Client and Tool Bridge
//!
//! Protocol handshake and capability negotiation for one MCP server,
//! `tools/list` / `tools/call`, the bridge that presents remote tools
//! as local `Tool`s, and the manager that owns all configured
//! connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, McpToolsChanged};
use crate::config::{McpServerConfig, McpServerKind};
use crate::mcp::transport::{
    HttpTransport, JsonRpcNotification, JsonRpcRequest, McpTransport, StdioTransport,
};
use crate::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput, ToolRegistry};

/// MCP protocol version advertised during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const CLIENT_NAME: &str = "quill";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Client state and capabilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Failed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Disconnected => "Disconnected",
            ClientState::Connecting => "Connecting",
            ClientState::Initializing => "Initializing",
            ClientState::Ready => "Ready",
            ClientState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// What the server advertised during `initialize`. Presence of the
/// capability key means supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerCapabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub logging: bool,
}

/// One tool as described by `tools/list`.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Manages the connection to a single MCP server.
pub struct McpClient {
    config: McpServerConfig,
    transport: Box<dyn McpTransport>,
    capabilities: RwLock<ServerCapabilities>,
    state: Mutex<ClientState>,
    /// Request ids are strictly increasing per connection.
    next_id: AtomicI64,
    bus: Option<Arc<EventBus>>,
}

impl McpClient {
    pub fn new(config: McpServerConfig, bus: Option<Arc<EventBus>>) -> Self {
        let transport: Box<dyn McpTransport> = match &config.kind {
            McpServerKind::Stdio { command, args, env } => {
                Box::new(StdioTransport::new(command, args, env))
            }
            McpServerKind::Http { url, headers } => Box::new(HttpTransport::new(url, headers)),
        };
        Self {
            config,
            transport,
            capabilities: RwLock::new(ServerCapabilities::default()),
            state: Mutex::new(ClientState::Disconnected),
            next_id: AtomicI64::new(1),
            bus,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        *self.capabilities.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Connect the transport and perform the MCP handshake.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ClientState::Connecting);

        if let Err(e) = self.transport.connect().await {
            self.set_state(ClientState::Failed);
            return Err(e.context(format!("MCP server '{}' failed to connect", self.config.name)));
        }

        // Server-originated notifications: a tool-list change is
        // republished on the event bus so subscribers can re-register.
        let bus = self.bus.clone();
        let server = self.config.name.clone();
        self.transport.set_notification_handler(Arc::new(move |method, params| {
            debug!(server = %server, method, ?params, "MCP notification");
            if method == "notifications/tools/list_changed" {
                if let Some(ref bus) = bus {
                    bus.publish(&McpToolsChanged {
                        server_name: server.clone(),
                    });
                }
            }
        }));

        if let Err(e) = self.initialize().await {
            self.set_state(ClientState::Failed);
            return Err(e.context(format!("MCP handshake failed for '{}'", self.config.name)));
        }

        self.set_state(ClientState::Ready);
        info!(server = %self.config.name, "MCP server ready");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        self.set_state(ClientState::Disconnected);
    }

    async fn initialize(&self) -> Result<()> {
        self.set_state(ClientState::Initializing);

        let request = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION},
            })),
        );

        let response = self.transport.send_request(request).await?;
        if !response.ok() {
            bail!("initialize error: {}", response.error_message());
        }

        if let Some(result) = response.result {
            if let Some(caps) = result.get("capabilities") {
                *self.capabilities.write().unwrap_or_else(|e| e.into_inner()) =
                    ServerCapabilities {
                        tools: caps.get("tools").is_some(),
                        resources: caps.get("resources").is_some(),
                        prompts: caps.get("prompts").is_some(),
                        logging: caps.get("logging").is_some(),
                    };
            }
            if let Some(server_info) = result.get("serverInfo") {
                info!(
                    server = %self.config.name,
                    name = server_info.get("name").and_then(|v| v.as_str()).unwrap_or("unknown"),
                    version = server_info.get("version").and_then(|v| v.as_str()).unwrap_or("unknown"),
                    "MCP server info"
                );
            }
        }

        self.transport
            .send_notification(JsonRpcNotification::new("notifications/initialized", None))
            .await?;
        Ok(())
    }

    /// List the server's tools. Empty when the server does not
    /// advertise the tools capability.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        if !self.is_ready() || !self.capabilities().tools {
            return Ok(Vec::new());
        }

        let request = JsonRpcRequest::new(self.next_id(), "tools/list", None);
        let response = self.transport.send_request(request).await?;
        if !response.ok() {
            bail!("tools/list error: {}", response.error_message());
        }

        let mut tools = Vec::new();
        if let Some(list) = response
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
        {
            for tool in list {
                tools.push(McpToolInfo {
                    name: tool
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    description: tool
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                });
            }
        }

        info!(server = %self.config.name, count = tools.len(), "MCP tools listed");
        Ok(tools)
    }

    /// Call a tool and return the raw MCP result
    /// (`{content: [...], isError?}`). JSON-RPC errors are folded into
    /// that shape so the bridge has one path.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if !self.is_ready() {
            bail!("MCP server '{}' is not ready", self.config.name);
        }

        // Servers reject null arguments; send an empty object instead.
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        let request = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            Some(json!({"name": name, "arguments": arguments})),
        );

        let response = self.transport.send_request(request).await?;
        if !response.ok() {
            return Ok(json!({
                "isError": true,
                "content": [{"type": "text", "text": response.error_message()}],
            }));
        }

        Ok(response.result.unwrap_or_else(|| json!({"content": []})))
    }
}

// ---------------------------------------------------------------------------
// Tool bridge
// ---------------------------------------------------------------------------

/// Presents one remote MCP tool as a local `Tool`.
pub struct McpToolBridge {
    id: String,
    description: String,
    client: Arc<McpClient>,
    info: McpToolInfo,
}

impl McpToolBridge {
    pub fn new(client: Arc<McpClient>, info: McpToolInfo) -> Self {
        Self {
            id: format!("mcp_{}_{}", client.server_name(), info.name),
            description: format!("[MCP:{}] {}", client.server_name(), info.description),
            client,
            info,
        }
    }
}

#[async_trait]
impl Tool for McpToolBridge {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        let mut params = Vec::new();

        let Some(props) = self
            .info
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
        else {
            return params;
        };
        let required: Vec<&str> = self
            .info
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        for (name, schema) in props {
            let enum_values = schema.get("enum").and_then(|e| e.as_array()).map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            });
            params.push(ParameterSchema {
                name: name.clone(),
                kind: ParamKind::parse(
                    schema.get("type").and_then(|t| t.as_str()).unwrap_or("string"),
                ),
                description: schema
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
                required: required.contains(&name.as_str()),
                default: schema.get("default").cloned(),
                enum_values,
            });
        }

        params
    }

    async fn execute(&self, args: Value, _ctx: ToolContext) -> Result<ToolOutput> {
        if !self.client.is_ready() {
            return Ok(ToolOutput::error(format!(
                "MCP server '{}' is not ready",
                self.client.server_name()
            )));
        }

        let result = match self.client.call_tool(&self.info.name, args).await {
            Ok(result) => result,
            Err(e) => return Ok(ToolOutput::error(format!("MCP tool call failed: {e}"))),
        };

        let is_error = result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        // Concatenate text-typed content parts; anything else is shown raw.
        let mut output = String::new();
        if let Some(content) = result.get("content").and_then(|c| c.as_array()) {
            for item in content {
                if item.get("type").and_then(|t| t.as_str()).unwrap_or("text") == "text" {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(item.get("text").and_then(|t| t.as_str()).unwrap_or(""));
                }
            }
        }
        if output.is_empty() {
            output = serde_json::to_string_pretty(&result).unwrap_or_default();
        }

        if is_error {
            Ok(ToolOutput::error(output))
        } else {
            Ok(ToolOutput::success(output))
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns every configured MCP connection and keeps the tool registry in
/// sync with what the servers offer.
pub struct McpManager {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    /// Ids of bridges we registered, for cleanup.
    registered: Mutex<Vec<String>>,
    bus: Arc<EventBus>,
}

impl McpManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            registered: Mutex::new(Vec::new()),
            bus,
        }
    }

    /// Create clients for every enabled server. Does not connect.
    pub fn initialize(&self, servers: &[McpServerConfig]) {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        for config in servers {
            if !config.enabled {
                info!(server = %config.name, "skipping disabled MCP server");
                continue;
            }
            let client = Arc::new(McpClient::new(config.clone(), Some(Arc::clone(&self.bus))));
            clients.insert(config.name.clone(), client);
        }
    }

    /// Connect every client. A server that fails to connect is logged
    /// and skipped; the rest keep working.
    pub async fn connect_all(&self) {
        for client in self.all_clients() {
            if let Err(e) = client.connect().await {
                warn!(server = %client.server_name(), err = %e, "MCP connect failed");
            }
        }
    }

    /// Disconnect everything, removing bridged tools first.
    pub async fn disconnect_all(&self, registry: &ToolRegistry) {
        self.unregister_tools(registry);
        let clients: Vec<Arc<McpClient>> = {
            let mut map = self.clients.write().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.disconnect().await;
        }
    }

    pub fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn all_clients(&self) -> Vec<Arc<McpClient>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Register a bridge for every tool of every ready server.
    /// Replaces any previously registered set.
    pub async fn register_tools(&self, registry: &ToolRegistry) {
        self.unregister_tools(registry);

        for client in self.all_clients() {
            if !client.is_ready() {
                continue;
            }
            let tools = match client.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = %client.server_name(), err = %e, "tools/list failed");
                    continue;
                }
            };
            for info in tools {
                let bridge = Arc::new(McpToolBridge::new(Arc::clone(&client), info));
                let id = bridge.id().to_string();
                registry.register(bridge);
                info!(tool = %id, "registered MCP tool");
                self.registered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(id);
            }
        }
    }

    /// Remove every bridge we registered.
    pub fn unregister_tools(&self, registry: &ToolRegistry) {
        let ids: Vec<String> = self
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for id in ids {
            registry.unregister(&id);
        }
    }

    pub fn tool_count(&self) -> usize {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
