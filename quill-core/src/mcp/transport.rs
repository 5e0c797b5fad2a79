//! MCP Transport
//!
//! JSON-RPC 2.0 over either a child process's stdio (with
//! `Content-Length` framing) or HTTP POST. The stdio variant owns a
//! writer task and a reader task; responses are correlated to pending
//! requests by id, and server-originated notifications are routed to a
//! registered handler.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// JSON-RPC wire types
// ---------------------------------------------------------------------------

/// JSON-RPC 2.0 request. Ids are assigned by the client, monotonically
/// increasing per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(e) => e.message.clone(),
            None => String::new(),
        }
    }

    /// A synthetic error response used when the transport fails a
    /// pending request.
    fn transport_error(id: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(JsonRpcError {
                code: -32000,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC notification (no id, no response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Connection state. Transitions are one-way except via reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportState::Disconnected => "Disconnected",
            TransportState::Connecting => "Connecting",
            TransportState::Connected => "Connected",
            TransportState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Callback for server-originated notifications: (method, params).
pub type NotificationHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Abstract MCP transport.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    /// Send a request and wait for the correlated response. A failed
    /// transport resolves pending requests with an error response.
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Best effort, no correlation.
    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()>;

    fn set_notification_handler(&self, handler: NotificationHandler);

    fn state(&self) -> TransportState;

    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }
}

// ---------------------------------------------------------------------------
// Content-Length framing
// ---------------------------------------------------------------------------

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length:";

/// Encode one message with `Content-Length: N\r\n\r\n` framing.
pub fn encode_frame(msg: &Value) -> Vec<u8> {
    let body = msg.to_string();
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

/// Incremental decoder for `Content-Length`-framed JSON messages.
///
/// Push raw bytes in; complete messages come out. A header block
/// without a parseable `Content-Length` is dropped; a partial body
/// stays buffered until the remaining bytes arrive.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            let Some(header_end) = find_subslice(&self.buf, HEADER_TERMINATOR) else {
                break;
            };

            let header = String::from_utf8_lossy(&self.buf[..header_end]).to_string();
            let Some(len) = parse_content_length(&header) else {
                warn!("dropping malformed MCP frame header");
                self.buf.drain(..header_end + HEADER_TERMINATOR.len());
                continue;
            };

            let body_start = header_end + HEADER_TERMINATOR.len();
            if self.buf.len() < body_start + len {
                break; // wait for the rest of the body
            }

            let body = self.buf[body_start..body_start + len].to_vec();
            self.buf.drain(..body_start + len);

            match serde_json::from_slice::<Value>(&body) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(err = %e, "failed to parse MCP message body"),
            }
        }

        messages
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(header: &str) -> Option<usize> {
    for line in header.split("\r\n") {
        if let Some(rest) = line.strip_prefix(CONTENT_LENGTH) {
            return rest.trim().parse().ok();
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Pending-request map
// ---------------------------------------------------------------------------

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

fn fail_pending(pending: &PendingMap, message: &str) {
    let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
    for (id, tx) in map.drain() {
        let _ = tx.send(JsonRpcResponse::transport_error(id, message));
    }
}

/// Route one incoming message: responses resolve their pending
/// request; anything with a `method` goes to the notification handler.
fn route_incoming(
    msg: Value,
    pending: &PendingMap,
    handler: &Arc<RwLock<Option<NotificationHandler>>>,
) {
    let has_id = msg.get("id").map(|v| !v.is_null()).unwrap_or(false);
    let is_response = has_id && (msg.get("result").is_some() || msg.get("error").is_some());

    if is_response {
        if let Ok(resp) = serde_json::from_value::<JsonRpcResponse>(msg) {
            let tx = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&resp.id);
            if let Some(tx) = tx {
                let _ = tx.send(resp);
            } else {
                debug!(id = resp.id, "response with no pending request");
            }
        }
        return;
    }

    if let Some(method) = msg.get("method").and_then(|m| m.as_str()) {
        let params = msg.get("params").cloned().unwrap_or(Value::Null);
        let handler = handler.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(h) = handler {
            h(method, params);
        }
    }
}

// ---------------------------------------------------------------------------
// Stdio transport
// ---------------------------------------------------------------------------

/// How long a request waits for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period between closing the child's stdin and killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// MCP transport over a child process's stdin/stdout. The child's
/// stderr is discarded so it cannot corrupt the protocol stream.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: PendingMap,
    state: Arc<Mutex<TransportState>>,
    handler: Arc<RwLock<Option<NotificationHandler>>>,
    stopping: Arc<AtomicBool>,
}

impl StdioTransport {
    pub fn new(command: &str, args: &[String], env: &HashMap<String, String>) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            env: env.clone(),
            child: tokio::sync::Mutex::new(None),
            stdin_tx: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            handler: Arc::new(RwLock::new(None)),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.set_state(TransportState::Connecting);
        self.stopping.store(false, Ordering::SeqCst);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            self.set_state(TransportState::Failed);
            anyhow::anyhow!("failed to spawn MCP server '{}': {}", self.command, e)
        })?;

        let mut stdin = child
            .stdin
            .take()
            .context("failed to capture MCP server stdin")?;
        let mut stdout = child
            .stdout
            .take()
            .context("failed to capture MCP server stdout")?;

        // Writer task: frames come in over a channel, go out to stdin.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
        let writer_state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(frame) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(&frame).await {
                    error!(err = %e, "MCP stdin write failed");
                    *writer_state.lock().unwrap_or_else(|p| p.into_inner()) =
                        TransportState::Failed;
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!(err = %e, "MCP stdin flush failed");
                    *writer_state.lock().unwrap_or_else(|p| p.into_inner()) =
                        TransportState::Failed;
                    break;
                }
            }
            // Channel closed: stdin drops here, signalling EOF to the child.
        });

        // Reader task: decode frames, correlate responses, dispatch
        // notifications.
        let pending = Arc::clone(&self.pending);
        let handler = Arc::clone(&self.handler);
        let reader_state = Arc::clone(&self.state);
        let stopping = Arc::clone(&self.stopping);
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        if !stopping.load(Ordering::SeqCst) {
                            warn!("MCP stdout closed");
                            *reader_state.lock().unwrap_or_else(|p| p.into_inner()) =
                                TransportState::Failed;
                        }
                        fail_pending(&pending, "transport disconnected");
                        break;
                    }
                    Ok(n) => {
                        for msg in decoder.push(&buf[..n]) {
                            route_incoming(msg, &pending, &handler);
                        }
                    }
                }
            }
        });

        *self.stdin_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(stdin_tx);
        *self.child.lock().await = Some(child);
        self.set_state(TransportState::Connected);
        info!(command = %self.command, "MCP stdio transport connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        // Dropping the sender ends the writer task, which closes the
        // child's stdin — its cue to exit voluntarily.
        self.stdin_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(?status, "MCP server exited on its own");
                }
                _ => {
                    let _ = child.kill().await;
                }
            }
        }

        fail_pending(&self.pending, "transport disconnected");
        self.set_state(TransportState::Disconnected);
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            bail!("MCP transport not connected");
        }

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let frame = encode_frame(&serde_json::to_value(&request)?);
        let sender = self
            .stdin_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(sender) = sender else {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            bail!("MCP transport not connected");
        };
        if sender.send(frame).await.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            bail!("MCP writer task stopped");
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => bail!("MCP response channel closed"),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                bail!("MCP request timed out after {:?}", REQUEST_TIMEOUT)
            }
        }
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        if !self.is_connected() {
            bail!("MCP transport not connected");
        }
        let frame = encode_frame(&serde_json::to_value(&notification)?);
        let sender = self
            .stdin_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match sender {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| anyhow::anyhow!("MCP writer task stopped")),
            None => bail!("MCP transport not connected"),
        }
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// MCP transport over HTTP POST. Each request expects a single
/// JSON-RPC response in the HTTP response body; notifications are
/// fire-and-forget.
pub struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    state: Arc<Mutex<TransportState>>,
    handler: Arc<RwLock<Option<NotificationHandler>>>,
}

impl HttpTransport {
    pub fn new(url: &str, headers: &HashMap<String, String>) -> Self {
        Self {
            url: url.to_string(),
            headers: headers.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            handler: Arc::new(RwLock::new(None)),
        }
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        req
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&self) -> Result<()> {
        // The connection is per-request; readiness is all we track.
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = TransportState::Connected;
        info!(url = %self.url, "MCP HTTP transport ready");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = TransportState::Disconnected;
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            bail!("MCP transport not connected");
        }

        let response = self
            .apply_headers(self.client.post(&self.url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("MCP HTTP request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            *self.state.lock().unwrap_or_else(|e| e.into_inner()) = TransportState::Failed;
            bail!("MCP HTTP error: {}", status);
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .context("invalid JSON-RPC response body")?;
        Ok(body)
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        if !self.is_connected() {
            bail!("MCP transport not connected");
        }
        let req = self
            .apply_headers(self.client.post(&self.url))
            .json(&notification);
        tokio::spawn(async move {
            if let Err(e) = req.send().await {
                warn!(err = %e, "MCP notification send failed");
            }
        });
        Ok(())
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
