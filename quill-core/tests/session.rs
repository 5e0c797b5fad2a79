//! End-to-end session engine scenarios against a scripted provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use quill_core::permission::PermissionManager;
use quill_core::provider::{ChatRequest, ModelInfo, Provider};
use quill_core::session::{Session, SessionCallbacks, SessionServices};
use quill_core::stream::{self, EventStream, StreamEvent};
use quill_core::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput, ToolRegistry};
use quill_core::types::{
    AgentProfile, AgentType, ContentPart, FinishReason, Permission, TokenUsage,
};
use quill_core::EventBus;

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

enum Script {
    /// Send these events, then close the stream.
    Events(Vec<StreamEvent>),
    /// Send these events, then keep the stream open forever.
    EventsThenHang(Vec<StreamEvent>),
}

struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![]
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<EventStream> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Events(vec![StreamEvent::FinishStep {
                reason: FinishReason::Stop,
                usage: TokenUsage::default(),
            }]));

        let (tx, rx) = stream::channel();
        tokio::spawn(async move {
            match script {
                Script::Events(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Script::EventsThenHang(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    // Hold the sender open until the session drops the
                    // receiver (cancellation).
                    tx.closed().await;
                }
            }
        });
        Ok(rx)
    }
}

fn finish(reason: FinishReason, input: u64, output: u64) -> StreamEvent {
    StreamEvent::FinishStep {
        reason,
        usage: TokenUsage::new(input, output),
    }
}

// ---------------------------------------------------------------------------
// Shared fixtures
// ---------------------------------------------------------------------------

/// Event log shared with the session callbacks.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }
    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

fn recording_callbacks(log: &Log) -> SessionCallbacks {
    let l = log.clone();
    let on_stream = Box::new(move |text: &str| l.push(format!("stream:{text}")));
    let l = log.clone();
    let on_tool_start = Box::new(move |tool: &str, _args: &str| l.push(format!("tool_start:{tool}")));
    let l = log.clone();
    let on_tool_end = Box::new(move |tool: &str, preview: &str, is_error: bool| {
        l.push(format!("tool_end:{tool}:{preview}:{is_error}"))
    });
    let l = log.clone();
    let on_error = Box::new(move |message: &str| l.push(format!("error:{message}")));
    let l = log.clone();
    let on_complete =
        Box::new(move |reason: FinishReason| l.push(format!("complete:{}", reason.as_str())));

    SessionCallbacks {
        on_stream: Some(on_stream),
        on_tool_start: Some(on_tool_start),
        on_tool_end: Some(on_tool_end),
        on_error: Some(on_error),
        on_complete: Some(on_complete),
        on_permission: None,
        on_question: None,
    }
}

struct EchoTool {
    invoked: Arc<Mutex<u32>>,
}

#[async_trait]
impl Tool for EchoTool {
    fn id(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the msg parameter back"
    }
    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![ParameterSchema::required(
            "msg",
            ParamKind::String,
            "Message to echo",
        )]
    }
    async fn execute(&self, args: Value, _ctx: ToolContext) -> Result<ToolOutput> {
        *self.invoked.lock().unwrap() += 1;
        let msg = args.get("msg").and_then(|v| v.as_str()).unwrap_or("");
        Ok(ToolOutput::success(msg))
    }
}

fn services_with(provider: Arc<dyn Provider>, registry: Arc<ToolRegistry>) -> SessionServices {
    SessionServices::new(
        provider,
        registry,
        Arc::new(PermissionManager::new()),
        Arc::new(EventBus::new()),
    )
}

fn profile(default_permission: Permission) -> AgentProfile {
    let mut profile = AgentProfile::for_type(AgentType::General);
    profile.model = "test-model".into();
    profile.default_permission = default_permission;
    profile
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Plain text turn: deltas stream through in order, the assistant
/// message is committed whole, usage is recorded.
#[tokio::test]
async fn plain_text_turn() {
    let provider = ScriptedProvider::new(vec![Script::Events(vec![
        StreamEvent::TextDelta("Hello from ".into()),
        StreamEvent::TextDelta("Qwen!".into()),
        finish(FinishReason::Stop, 10, 5),
    ])]);

    let session = Session::new(
        profile(Permission::Ask),
        services_with(provider, Arc::new(ToolRegistry::new())),
    );
    let log = Log::default();
    session.set_callbacks(recording_callbacks(&log));

    let reason = session.prompt("hi").await.unwrap();
    assert_eq!(reason, FinishReason::Stop);

    assert_eq!(
        log.entries(),
        vec!["stream:Hello from ", "stream:Qwen!", "complete:stop"]
    );

    let transcript = session.transcript();
    assert_eq!(transcript.len(), 2);
    let last = transcript.last().unwrap();
    assert_eq!(last.parts.len(), 1);
    assert_eq!(last.text(), "Hello from Qwen!");

    assert_eq!(session.cumulative_usage(), TokenUsage::new(10, 5));
}

/// Single tool round-trip: tool runs, its result is fed back, the
/// second stream completes the prompt, usage sums across both steps.
#[tokio::test]
async fn single_tool_round_trip() {
    let provider = ScriptedProvider::new(vec![
        Script::Events(vec![
            StreamEvent::ToolCallComplete {
                id: "t1".into(),
                name: "echo".into(),
                arguments: json!({"msg": "x"}),
            },
            finish(FinishReason::ToolCalls, 20, 10),
        ]),
        Script::Events(vec![
            StreamEvent::TextDelta("done".into()),
            finish(FinishReason::Stop, 30, 5),
        ]),
    ]);

    let invoked = Arc::new(Mutex::new(0));
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(EchoTool {
        invoked: invoked.clone(),
    }));

    let session = Session::new(
        profile(Permission::Allow),
        services_with(provider, registry),
    );
    let log = Log::default();
    session.set_callbacks(recording_callbacks(&log));

    let reason = session.prompt("run echo").await.unwrap();
    assert_eq!(reason, FinishReason::Stop);
    assert_eq!(*invoked.lock().unwrap(), 1);

    assert_eq!(
        log.entries(),
        vec![
            "tool_start:echo",
            "tool_end:echo:x:false",
            "stream:done",
            "complete:stop",
        ]
    );

    // user, assistant(tool_use), user(tool_result), assistant(text)
    let transcript = session.transcript();
    assert_eq!(transcript.len(), 4);
    assert_eq!(transcript[1].tool_uses().count(), 1);
    assert!(matches!(
        transcript[2].parts[0],
        ContentPart::ToolResult { ref tool_use_id, is_error: false, .. } if tool_use_id == "t1"
    ));
    assert_eq!(transcript[3].text(), "done");

    assert_eq!(session.cumulative_usage(), TokenUsage::new(50, 15));
}

/// Every tool_use id in an assistant message is answered by exactly
/// one tool_result in the following user message, in input order.
#[tokio::test]
async fn tool_use_result_pairing() {
    let provider = ScriptedProvider::new(vec![
        Script::Events(vec![
            StreamEvent::ToolCallComplete {
                id: "a".into(),
                name: "echo".into(),
                arguments: json!({"msg": "1"}),
            },
            StreamEvent::ToolCallComplete {
                id: "b".into(),
                name: "missing_tool".into(),
                arguments: json!({}),
            },
            StreamEvent::ToolCallComplete {
                id: "c".into(),
                name: "echo".into(),
                arguments: json!({"msg": "3"}),
            },
            finish(FinishReason::ToolCalls, 1, 1),
        ]),
        Script::Events(vec![finish(FinishReason::Stop, 1, 1)]),
    ]);

    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(EchoTool {
        invoked: Arc::new(Mutex::new(0)),
    }));

    let session = Session::new(
        profile(Permission::Allow),
        services_with(provider, registry),
    );
    session.prompt("go").await.unwrap();

    let transcript = session.transcript();
    let use_ids: Vec<String> = transcript[1]
        .tool_uses()
        .map(|(id, _, _)| id.to_string())
        .collect();
    let result_ids: Vec<String> = transcript[2]
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
            _ => None,
        })
        .collect();

    assert_eq!(use_ids, vec!["a", "b", "c"]);
    assert_eq!(use_ids, result_ids);
}

/// Denied tool: execute is never invoked, the synthetic result is an
/// error mentioning the denial, and the loop continues.
#[tokio::test]
async fn denied_tool_synthesizes_error_result() {
    let provider = ScriptedProvider::new(vec![
        Script::Events(vec![
            StreamEvent::ToolCallComplete {
                id: "t2".into(),
                name: "echo".into(),
                arguments: json!({"msg": "nope"}),
            },
            finish(FinishReason::ToolCalls, 1, 1),
        ]),
        Script::Events(vec![finish(FinishReason::Stop, 1, 1)]),
    ]);

    let invoked = Arc::new(Mutex::new(0));
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(EchoTool {
        invoked: invoked.clone(),
    }));

    let mut p = profile(Permission::Allow);
    p.denied_tools.push("echo".into());

    let session = Session::new(p, services_with(provider, registry));
    let reason = session.prompt("go").await.unwrap();

    assert_eq!(reason, FinishReason::Stop);
    assert_eq!(*invoked.lock().unwrap(), 0);

    let transcript = session.transcript();
    match &transcript[2].parts[0] {
        ContentPart::ToolResult {
            is_error, content, ..
        } => {
            assert!(is_error);
            assert!(content.to_lowercase().contains("denied"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

/// Ask verdicts flow through the permission callback; AlwaysAllow
/// caches the grant for subsequent checks.
#[tokio::test]
async fn ask_callback_decides_and_caches() {
    let provider = ScriptedProvider::new(vec![
        Script::Events(vec![
            StreamEvent::ToolCallComplete {
                id: "t1".into(),
                name: "echo".into(),
                arguments: json!({"msg": "one"}),
            },
            finish(FinishReason::ToolCalls, 1, 1),
        ]),
        Script::Events(vec![finish(FinishReason::Stop, 1, 1)]),
    ]);

    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(EchoTool {
        invoked: Arc::new(Mutex::new(0)),
    }));

    let permissions = Arc::new(PermissionManager::new());
    let services = SessionServices::new(
        provider,
        registry,
        permissions.clone(),
        Arc::new(EventBus::new()),
    );

    let session = Session::new(profile(Permission::Ask), services);
    let asked = Arc::new(Mutex::new(0));
    let asked_in_cb = asked.clone();
    session.set_callbacks(SessionCallbacks {
        on_permission: Some(Box::new(move |_tool, _args| {
            *asked_in_cb.lock().unwrap() += 1;
            quill_core::permission::PermissionDecision::AlwaysAllow
        })),
        ..Default::default()
    });

    session.prompt("go").await.unwrap();
    assert_eq!(*asked.lock().unwrap(), 1);
    // The "always" decision landed in the runtime cache.
    assert_eq!(permissions.cached("echo"), Some(Permission::Allow));
}

/// Cancellation mid-stream: the blocked stream is released, exactly
/// one Cancelled completion is delivered, further cancels are no-ops.
#[tokio::test]
async fn cancellation_mid_stream() {
    let provider = ScriptedProvider::new(vec![Script::EventsThenHang(vec![
        StreamEvent::TextDelta("a".into()),
    ])]);

    let session = Session::new(
        profile(Permission::Ask),
        services_with(provider, Arc::new(ToolRegistry::new())),
    );
    let log = Log::default();
    session.set_callbacks(recording_callbacks(&log));

    let driver = {
        let session = session.clone();
        tokio::spawn(async move { session.prompt("hang").await })
    };

    // Let the first delta arrive, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.cancel();

    let reason = tokio::time::timeout(Duration::from_secs(1), driver)
        .await
        .expect("driver must be released")
        .unwrap()
        .unwrap();
    assert_eq!(reason, FinishReason::Cancelled);

    assert_eq!(log.entries(), vec!["stream:a", "complete:cancelled"]);

    // Idempotent: no further callbacks.
    session.cancel();
    session.cancel();
    assert_eq!(log.entries(), vec!["stream:a", "complete:cancelled"]);
}

/// The task tool spawns a child session whose streamed output becomes
/// the tool result in the parent transcript.
#[tokio::test]
async fn task_tool_pipes_child_output() {
    let provider = ScriptedProvider::new(vec![
        // Parent turn 1: delegate to a child agent.
        Script::Events(vec![
            StreamEvent::ToolCallComplete {
                id: "t1".into(),
                name: "task".into(),
                arguments: json!({
                    "prompt": "summarize the repo",
                    "description": "repo summary",
                    "subagent_type": "general",
                }),
            },
            finish(FinishReason::ToolCalls, 2, 2),
        ]),
        // Child session's only turn.
        Script::Events(vec![
            StreamEvent::TextDelta("child says hi".into()),
            finish(FinishReason::Stop, 3, 3),
        ]),
        // Parent turn 2: wrap up.
        Script::Events(vec![
            StreamEvent::TextDelta("delegated".into()),
            finish(FinishReason::Stop, 4, 1),
        ]),
    ]);

    let registry = Arc::new(ToolRegistry::new());
    quill_core::tools::register_builtins(&registry);

    let session = Session::new(
        profile(Permission::Allow),
        services_with(provider, registry),
    );
    let reason = session.prompt("delegate this").await.unwrap();
    assert_eq!(reason, FinishReason::Stop);

    let transcript = session.transcript();
    match &transcript[2].parts[0] {
        ContentPart::ToolResult {
            content, is_error, ..
        } => {
            assert!(!is_error);
            assert!(content.contains("child says hi"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

/// Sessions persist through the message store on every append.
#[tokio::test]
async fn session_persists_records() {
    use quill_core::persistence::{MessageStore, SessionMeta, SessionRecord};

    #[derive(Default)]
    struct MemoryStore {
        saves: Mutex<Vec<SessionRecord>>,
    }

    #[async_trait]
    impl MessageStore for MemoryStore {
        async fn save(&self, record: &SessionRecord) -> Result<()> {
            self.saves.lock().unwrap().push(record.clone());
            Ok(())
        }
        async fn load(&self, _id: &str) -> Result<SessionRecord> {
            anyhow::bail!("not used")
        }
        async fn list(&self) -> Result<Vec<SessionMeta>> {
            Ok(vec![])
        }
    }

    let provider = ScriptedProvider::new(vec![Script::Events(vec![
        StreamEvent::TextDelta("hello".into()),
        finish(FinishReason::Stop, 10, 2),
    ])]);

    let store = Arc::new(MemoryStore::default());
    let services = services_with(provider, Arc::new(ToolRegistry::new()))
        .with_store(store.clone() as Arc<dyn MessageStore>);

    let session = Session::new(profile(Permission::Ask), services);
    session.prompt("persist me").await.unwrap();

    let saves = store.saves.lock().unwrap();
    assert!(!saves.is_empty());
    let last = saves.last().unwrap();
    assert_eq!(last.id, session.id());
    assert_eq!(last.messages.len(), 2);
    assert_eq!(last.usage, TokenUsage::new(10, 2));
    assert_eq!(last.title, "persist me");
}

/// Usage additivity across many steps.
#[tokio::test]
async fn usage_sums_across_steps() {
    let provider = ScriptedProvider::new(vec![
        Script::Events(vec![
            StreamEvent::ToolCallComplete {
                id: "t1".into(),
                name: "missing".into(),
                arguments: json!({}),
            },
            finish(FinishReason::ToolCalls, 7, 3),
        ]),
        Script::Events(vec![
            StreamEvent::ToolCallComplete {
                id: "t2".into(),
                name: "missing".into(),
                arguments: json!({}),
            },
            finish(FinishReason::ToolCalls, 11, 2),
        ]),
        Script::Events(vec![finish(FinishReason::Stop, 5, 1)]),
    ]);

    let session = Session::new(
        profile(Permission::Allow),
        services_with(provider, Arc::new(ToolRegistry::new())),
    );
    session.prompt("go").await.unwrap();

    assert_eq!(session.cumulative_usage(), TokenUsage::new(23, 6));
    assert_eq!(session.cumulative_usage().total(), 29);
}
