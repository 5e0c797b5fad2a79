//! Model Context Protocol
//!
//! Client-side MCP: JSON-RPC transports (stdio and HTTP), the
//! protocol client with its handshake, and the bridge that exposes
//! remote tools through the local tool registry.

pub mod client;
pub mod transport;

pub use client::{ClientState, McpClient, McpManager, McpToolBridge, McpToolInfo, ServerCapabilities};
pub use transport::{
    FrameDecoder, HttpTransport, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpTransport, NotificationHandler, StdioTransport, TransportState,
};
