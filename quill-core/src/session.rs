//! Session Engine
//!
//! The turn loop at the heart of a session: stream the model's
//! response, execute any requested tools behind the permission gate,
//! feed results back, and repeat until the model stops, the round cap
//! trips, or the user cancels. The transcript is mutated only here, by
//! the single driver task running `prompt`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{
    EventBus, SessionCreated, SessionEnded, StreamDelta, ToolCallCompleted, ToolCallStarted,
};
use crate::context::{estimate_tokens, estimate_transcript_tokens, truncate_output, ContextLimits};
use crate::permission::{PermissionDecision, PermissionManager};
use crate::persistence::{MessageStore, SessionRecord};
use crate::provider::{ChatRequest, Provider, ToolSpec};
use crate::retry::RetryPolicy;
use crate::stream::StreamEvent;
use crate::system_prompt::build_system_prompt;
use crate::tool::{QuestionHandler, SubagentFactory, ToolContext, ToolOutput, ToolRegistry};
use crate::types::{
    AgentProfile, AgentType, ContentPart, FinishReason, Message, Permission, TokenUsage,
};

/// Child sessions may nest at most this deep.
pub const MAX_SUBAGENT_DEPTH: usize = 3;

/// How long cancelled tool executions get to observe the flag before
/// the engine abandons them.
const TOOL_CANCEL_GRACE: Duration = Duration::from_millis(100);

/// Callback previews are clipped to this many characters.
const PREVIEW_CHARS: usize = 80;

// ---------------------------------------------------------------------------
// Shared services and callbacks
// ---------------------------------------------------------------------------

/// The process-level collaborators a session runs against. Explicitly
/// constructed once (at the outermost binary) and cloned into every
/// session, including children.
#[derive(Clone)]
pub struct SessionServices {
    pub provider: Arc<dyn Provider>,
    pub registry: Arc<ToolRegistry>,
    pub permissions: Arc<PermissionManager>,
    pub bus: Arc<EventBus>,
    pub store: Option<Arc<dyn MessageStore>>,
    pub limits: ContextLimits,
    pub retry: RetryPolicy,
    pub max_rounds: usize,
    pub working_dir: PathBuf,
}

impl SessionServices {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            registry,
            permissions,
            bus,
            store: None,
            limits: ContextLimits::default(),
            retry: RetryPolicy::default(),
            max_rounds: 100,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }
}

/// Callbacks delivered to the UI, in the order the driver generates
/// them: stream deltas are monotonic, `on_tool_start` precedes
/// `on_tool_end` for the same call, `on_complete` is last.
#[derive(Default)]
pub struct SessionCallbacks {
    pub on_stream: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// (tool_id, args_preview)
    pub on_tool_start: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
    /// (tool_id, result_preview, is_error)
    pub on_tool_end: Option<Box<dyn Fn(&str, &str, bool) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_complete: Option<Box<dyn Fn(FinishReason) + Send + Sync>>,
    /// Ask-gate verdict for (tool_id, args). Absent means deny.
    pub on_permission: Option<Box<dyn Fn(&str, &Value) -> PermissionDecision + Send + Sync>>,
    pub on_question: Option<QuestionHandler>,
}

/// Where the session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    ExecutingTools,
    Cancelling,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    id: String,
    profile: AgentProfile,
    system_prompt: String,
    services: SessionServices,
    depth: usize,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    transcript: Mutex<Vec<Message>>,
    usage: Mutex<TokenUsage>,
    title: Mutex<String>,
    callbacks: RwLock<SessionCallbacks>,
}

impl Session {
    /// Create a top-level session.
    pub fn new(profile: AgentProfile, services: SessionServices) -> Arc<Self> {
        Self::spawn(profile, services, 0, None, CancellationToken::new())
    }

    fn spawn(
        profile: AgentProfile,
        services: SessionServices,
        depth: usize,
        parent_id: Option<String>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let system_prompt = build_system_prompt(&profile, &services.working_dir);
        info!(session_id = %id, agent_type = profile.agent_type.as_str(), depth, "created session");
        services.bus.publish(&SessionCreated {
            session_id: id.clone(),
        });
        Arc::new(Self {
            id,
            profile,
            system_prompt,
            services,
            depth,
            parent_id,
            created_at: Utc::now(),
            cancel,
            state: Mutex::new(SessionState::Idle),
            transcript: Mutex::new(Vec::new()),
            usage: Mutex::new(TokenUsage::default()),
            title: Mutex::new(String::new()),
            callbacks: RwLock::new(SessionCallbacks::default()),
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_type(&self) -> AgentType {
        self.profile.agent_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cumulative_usage(&self) -> TokenUsage {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A snapshot of the transcript.
    pub fn transcript(&self) -> Vec<Message> {
        self.transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_callbacks(&self, callbacks: SessionCallbacks) {
        *self.callbacks.write().unwrap_or_else(|e| e.into_inner()) = callbacks;
    }

    /// Estimated tokens the next request will carry.
    pub fn estimated_context_tokens(&self) -> usize {
        let transcript = self.transcript.lock().unwrap_or_else(|e| e.into_inner());
        estimate_tokens(&self.system_prompt) + estimate_transcript_tokens(&transcript)
    }

    /// The active model's context window.
    pub fn context_window(&self) -> u32 {
        self.services
            .provider
            .get_model(&self.profile.model)
            .map(|m| m.context_window)
            .unwrap_or(200_000)
    }

    /// Request cancellation of the in-flight prompt. Idempotent; the
    /// driver delivers `on_complete(Cancelled)` exactly once.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(session_id = %self.id, "cancelling session");
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != SessionState::Idle {
                *state = SessionState::Cancelling;
            }
        }
        self.cancel.cancel();
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    // -- the turn loop ------------------------------------------------------

    /// Drive one user prompt to completion. This is the session's
    /// single writer: it owns the transcript for the duration.
    pub async fn prompt(&self, text: &str) -> Result<FinishReason> {
        if self.cancel.is_cancelled() {
            bail!("session is cancelled");
        }
        if self.state() != SessionState::Idle {
            bail!("session is busy");
        }

        self.set_state(SessionState::Streaming);

        {
            let mut title = self.title.lock().unwrap_or_else(|e| e.into_inner());
            if title.is_empty() {
                *title = preview(text);
            }
        }
        self.append_message(Message::user(text));
        self.persist().await;

        let specs = self.services.registry.specs();
        let mut rounds = 0usize;

        loop {
            if rounds >= self.services.max_rounds {
                warn!(session_id = %self.id, rounds, "tool round limit exceeded");
                self.append_message(Message::system(format!(
                    "Stopped: exceeded the maximum of {} tool rounds for one prompt.",
                    self.services.max_rounds
                )));
                self.persist().await;
                return Ok(self.finish(FinishReason::Length));
            }
            rounds += 1;

            let request = self.build_request(&specs);
            match self.stream_turn(&request).await {
                TurnOutcome::ToolCalls { message } => {
                    self.set_state(SessionState::ExecutingTools);
                    let Some(parts) = self.run_tools(&message).await else {
                        return Ok(self.finish(FinishReason::Cancelled));
                    };
                    self.append_message(Message::tool_results(parts));
                    self.persist().await;
                    if self.cancel.is_cancelled() {
                        return Ok(self.finish(FinishReason::Cancelled));
                    }
                    self.set_state(SessionState::Streaming);
                }
                TurnOutcome::Finished { reason } => {
                    self.persist().await;
                    return Ok(self.finish(reason));
                }
                TurnOutcome::Cancelled => {
                    return Ok(self.finish(FinishReason::Cancelled));
                }
                TurnOutcome::Error { message } => {
                    self.emit_error(&message);
                    return Ok(self.finish(FinishReason::Error));
                }
            }
        }
    }

    fn build_request(&self, specs: &[ToolSpec]) -> ChatRequest {
        ChatRequest {
            model: self.profile.model.clone(),
            system_prompt: self.system_prompt.clone(),
            messages: self.transcript(),
            tools: specs.to_vec(),
            max_tokens: self.profile.max_tokens,
            temperature: None,
        }
    }

    /// Run one model turn, retrying retryable stream errors with
    /// backoff. On success the assistant message is committed.
    async fn stream_turn(&self, request: &ChatRequest) -> TurnOutcome {
        let mut attempt: u32 = 0;
        loop {
            match self.stream_once(request).await {
                StreamAttempt::Completed {
                    reason,
                    usage,
                    text,
                    calls,
                } => {
                    // A step that produced tool calls continues the
                    // loop regardless of the advertised reason, so
                    // every tool_use gets its paired result.
                    let has_calls = !calls.is_empty();

                    let mut parts = Vec::new();
                    if !text.is_empty() {
                        parts.push(ContentPart::text(text));
                    }
                    for (id, name, arguments) in calls {
                        parts.push(ContentPart::ToolUse {
                            id,
                            name,
                            input: arguments,
                        });
                    }
                    let message = Message::assistant(parts);
                    if !message.parts.is_empty() {
                        self.append_message(message.clone());
                    }
                    *self.usage.lock().unwrap_or_else(|e| e.into_inner()) += usage;
                    self.persist().await;

                    return if has_calls {
                        TurnOutcome::ToolCalls { message }
                    } else {
                        TurnOutcome::Finished { reason }
                    };
                }
                StreamAttempt::Cancelled => return TurnOutcome::Cancelled,
                StreamAttempt::Failed { message, retryable } => {
                    if retryable && attempt < self.services.retry.max_retries {
                        let delay = self.services.retry.delay_for_attempt(attempt);
                        attempt += 1;
                        warn!(
                            session_id = %self.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            err = %message,
                            "retrying model stream"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => return TurnOutcome::Cancelled,
                        }
                        continue;
                    }
                    return TurnOutcome::Error { message };
                }
            }
        }
    }

    /// Consume one provider stream to its terminal event.
    async fn stream_once(&self, request: &ChatRequest) -> StreamAttempt {
        let mut rx = match self.services.provider.stream(request).await {
            Ok(rx) => rx,
            Err(e) => {
                return StreamAttempt::Failed {
                    message: e.to_string(),
                    retryable: true,
                }
            }
        };

        let mut text = String::new();
        let mut calls: Vec<(String, String, Value)> = Vec::new();

        loop {
            tokio::select! {
                // Dropping the receiver aborts the producer and its
                // HTTP connection.
                _ = self.cancel.cancelled() => return StreamAttempt::Cancelled,
                event = rx.recv() => match event {
                    Some(StreamEvent::TextDelta(delta)) => {
                        text.push_str(&delta);
                        self.emit_stream(&delta);
                    }
                    Some(StreamEvent::ToolCallDelta { .. }) => {
                        // Argument assembly happens in the adapter.
                    }
                    Some(StreamEvent::ToolCallComplete { id, name, arguments }) => {
                        debug!(session_id = %self.id, tool = %name, "tool call complete");
                        calls.push((id, name, arguments));
                    }
                    Some(StreamEvent::FinishStep { reason, usage }) => {
                        return StreamAttempt::Completed { reason, usage, text, calls };
                    }
                    Some(StreamEvent::StreamError { message, retryable }) => {
                        return StreamAttempt::Failed { message, retryable };
                    }
                    None => {
                        return StreamAttempt::Failed {
                            message: "model stream ended without a finish event".into(),
                            retryable: false,
                        };
                    }
                }
            }
        }
    }

    // -- tool execution -----------------------------------------------------

    /// Execute every tool call of the committed assistant message
    /// concurrently, preserving input order in the results. Returns
    /// `None` when cancellation abandoned still-running tools.
    async fn run_tools(&self, message: &Message) -> Option<Vec<ContentPart>> {
        let tool_cancel = self.cancel.child_token();
        let question_handler = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .on_question
            .clone();

        let ctx = ToolContext {
            session_id: self.id.clone(),
            message_id: message.id.clone(),
            working_dir: self.services.working_dir.clone(),
            cancel: tool_cancel.clone(),
            question_handler,
            subagents: Some(self.subagent_factory(&tool_cancel)),
        };

        let futures: Vec<_> = message
            .tool_uses()
            .map(|(call_id, name, input)| {
                let ctx = ctx.clone();
                let call_id = call_id.to_string();
                let name = name.to_string();
                let input = input.clone();
                async move {
                    let output = self.run_tool(&name, input, ctx).await;
                    ContentPart::ToolResult {
                        tool_use_id: call_id,
                        tool_name: name,
                        content: truncate_output(&output.content, &self.services.limits),
                        is_error: output.is_error,
                    }
                }
            })
            .collect();

        let exec = join_all(futures);
        tokio::pin!(exec);

        tokio::select! {
            parts = &mut exec => Some(parts),
            _ = self.cancel.cancelled() => {
                // Give running tools a moment to observe the flag.
                match tokio::time::timeout(TOOL_CANCEL_GRACE, &mut exec).await {
                    Ok(parts) => Some(parts),
                    Err(_) => {
                        warn!(session_id = %self.id, "abandoning tool executions after cancel");
                        None
                    }
                }
            }
        }
    }

    /// Resolve, permission-check, and execute one tool call.
    async fn run_tool(&self, name: &str, input: Value, ctx: ToolContext) -> ToolOutput {
        let Some(tool) = self.services.registry.get(name) else {
            warn!(session_id = %self.id, tool = %name, "tool not found");
            return ToolOutput::error(format!("Tool not found: {name}"));
        };

        let verdict = match self.services.permissions.check(name, &self.profile) {
            Permission::Ask => match self.ask_permission(name, &input) {
                PermissionDecision::Allow => Permission::Allow,
                PermissionDecision::AlwaysAllow => {
                    self.services.permissions.grant(name);
                    Permission::Allow
                }
                PermissionDecision::Deny => Permission::Deny,
                PermissionDecision::AlwaysDeny => {
                    self.services.permissions.deny(name);
                    Permission::Deny
                }
            },
            verdict => verdict,
        };

        if verdict == Permission::Deny {
            info!(session_id = %self.id, tool = %name, "tool denied");
            return ToolOutput::error(format!("Permission denied for tool '{name}'"));
        }

        self.emit_tool_start(name, &preview(&input.to_string()));
        let output = match tool.execute(input, ctx).await {
            Ok(output) => output,
            Err(e) => ToolOutput::error(format!("Tool execution failed: {e}")),
        };
        self.emit_tool_end(name, &preview(&output.content), output.is_error);
        output
    }

    fn ask_permission(&self, tool_id: &str, args: &Value) -> PermissionDecision {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        match callbacks.on_permission {
            Some(ref f) => f(tool_id, args),
            // No UI attached: an Ask that nobody can answer is a deny.
            None => PermissionDecision::Deny,
        }
    }

    /// Factory handed to tools that spawn child sessions. The child
    /// shares this session's services and chains its cancellation to
    /// the invoking tool context.
    fn subagent_factory(&self, parent_cancel: &CancellationToken) -> SubagentFactory {
        let services = self.services.clone();
        let model = self.profile.model.clone();
        let depth = self.depth;
        let parent_id = self.id.clone();
        let parent_cancel = parent_cancel.clone();
        Arc::new(move |agent_type: AgentType| {
            if depth >= MAX_SUBAGENT_DEPTH {
                bail!("subagent recursion limit ({MAX_SUBAGENT_DEPTH}) reached");
            }
            let mut profile = AgentProfile::for_type(agent_type);
            profile.model = model.clone();
            Ok(Session::spawn(
                profile,
                services.clone(),
                depth + 1,
                Some(parent_id.clone()),
                parent_cancel.child_token(),
            ))
        })
    }

    // -- bookkeeping --------------------------------------------------------

    fn append_message(&self, message: Message) {
        self.transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    async fn persist(&self) {
        let Some(ref store) = self.services.store else {
            return;
        };
        let record = SessionRecord {
            id: self.id.clone(),
            agent_type: self.profile.agent_type,
            title: self.title.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            usage: self.cumulative_usage(),
            messages: self.transcript(),
        };
        if let Err(e) = store.save(&record).await {
            warn!(session_id = %self.id, err = %e, "failed to persist session");
        }
    }

    fn finish(&self, reason: FinishReason) -> FinishReason {
        self.set_state(SessionState::Idle);
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        if let Some(ref f) = callbacks.on_complete {
            f(reason);
        }
        drop(callbacks);
        self.services.bus.publish(&SessionEnded {
            session_id: self.id.clone(),
            reason,
        });
        info!(session_id = %self.id, reason = reason.as_str(), "prompt finished");
        reason
    }

    // -- callback emission --------------------------------------------------

    fn emit_stream(&self, delta: &str) {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        if let Some(ref f) = callbacks.on_stream {
            f(delta);
        }
        drop(callbacks);
        self.services.bus.publish(&StreamDelta {
            session_id: self.id.clone(),
            text: delta.to_string(),
        });
    }

    fn emit_tool_start(&self, tool_id: &str, args_preview: &str) {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        if let Some(ref f) = callbacks.on_tool_start {
            f(tool_id, args_preview);
        }
        drop(callbacks);
        self.services.bus.publish(&ToolCallStarted {
            session_id: self.id.clone(),
            tool_id: tool_id.to_string(),
            tool_name: tool_id.to_string(),
        });
    }

    fn emit_tool_end(&self, tool_id: &str, result_preview: &str, is_error: bool) {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        if let Some(ref f) = callbacks.on_tool_end {
            f(tool_id, result_preview, is_error);
        }
        drop(callbacks);
        self.services.bus.publish(&ToolCallCompleted {
            session_id: self.id.clone(),
            tool_id: tool_id.to_string(),
            tool_name: tool_id.to_string(),
            success: !is_error,
        });
    }

    fn emit_error(&self, message: &str) {
        warn!(session_id = %self.id, err = %message, "session error");
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        if let Some(ref f) = callbacks.on_error {
            f(message);
        }
    }
}

// ---------------------------------------------------------------------------
// Turn bookkeeping
// ---------------------------------------------------------------------------

enum TurnOutcome {
    /// The committed assistant message carries tool calls to execute.
    ToolCalls { message: Message },
    Finished { reason: FinishReason },
    Cancelled,
    Error { message: String },
}

enum StreamAttempt {
    Completed {
        reason: FinishReason,
        usage: TokenUsage,
        text: String,
        calls: Vec<(String, String, Value)>,
    },
    Cancelled,
    Failed {
        message: String,
        retryable: bool,
    },
}

/// First line of `s`, clipped for display.
fn preview(s: &str) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.len() <= PREVIEW_CHARS {
        line.to_string()
    } else {
        let cut = line
            .char_indices()
            .take_while(|(i, _)| *i < PREVIEW_CHARS)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &line[..cut])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
