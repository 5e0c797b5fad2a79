//! Quill CLI
//!
//! Binary entry point: loads config, assembles the process-level
//! services (provider, tool registry, permission manager, event bus,
//! MCP manager, session store), and drives sessions from the terminal.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use quill_core::config::{sample_config, Config};
use quill_core::mcp::McpManager;
use quill_core::permission::{PermissionDecision, PermissionManager};
use quill_core::provider::Provider;
use quill_core::session::{Session, SessionCallbacks, SessionServices};
use quill_core::tool::ToolRegistry;
use quill_core::tools::register_builtins;
use quill_core::types::{AgentType, FinishReason};
use quill_core::EventBus;
use quill_provider_anthropic::AnthropicProvider;
use quill_provider_openai::OpenAiProvider;
use quill_storage_fs::FsMessageStore;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "quill", version, about = "Quill — terminal coding assistant")]
struct Cli {
    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent type: build, explore, general, plan
    #[arg(long, global = true, default_value = "build")]
    agent: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single prompt and print the response
    Run {
        /// The prompt text
        prompt: String,
    },
    /// Interactive chat REPL
    Chat,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List persisted sessions
    Sessions,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration
    Show,
    /// Write a sample config file
    Init,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Logging goes to stderr; stdout is for the model's output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("quill: {e}");
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load_default()?,
    };

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Run { prompt } => {
            let runtime = Runtime::build(&config, &cli.agent).await?;
            runtime.run_prompt(&prompt).await?;
            runtime.shutdown().await;
            Ok(())
        }
        Commands::Chat => {
            let runtime = Runtime::build(&config, &cli.agent).await?;
            runtime.chat_loop().await?;
            runtime.shutdown().await;
            Ok(())
        }
        Commands::Config { action } => run_config_command(action, &config),
        Commands::Sessions => list_sessions().await,
    }
}

// ---------------------------------------------------------------------------
// Runtime assembly
// ---------------------------------------------------------------------------

/// The assembled process-level state. This is the one place where
/// "global" defaults exist; everything below it takes explicit
/// references.
struct Runtime {
    session: Arc<Session>,
    registry: Arc<ToolRegistry>,
    mcp: McpManager,
}

impl Runtime {
    async fn build(config: &Config, agent: &str) -> Result<Self> {
        for warning in config.validate()? {
            warn!("{warning}");
        }

        let provider = make_provider(config)?;
        info!(provider = provider.name(), model = %config.default_model, "provider ready");

        let registry = Arc::new(ToolRegistry::new());
        register_builtins(&registry);

        let permissions = Arc::new(PermissionManager::new());
        let bus = Arc::new(EventBus::new());

        // MCP servers are optional; a failure to connect must not
        // take the whole CLI down.
        let mcp = McpManager::new(Arc::clone(&bus));
        mcp.initialize(&config.mcp_servers);
        mcp.connect_all().await;
        mcp.register_tools(&registry).await;
        if mcp.tool_count() > 0 {
            info!(count = mcp.tool_count(), "MCP tools registered");
        }

        let store = match Config::config_dir().and_then(|dir| FsMessageStore::new(&dir)) {
            Ok(store) => Some(Arc::new(store) as Arc<dyn quill_core::MessageStore>),
            Err(e) => {
                error!(err = %e, "session persistence disabled");
                None
            }
        };

        let mut services = SessionServices::new(
            provider,
            Arc::clone(&registry),
            permissions,
            Arc::clone(&bus),
        );
        services.limits = config.context.clone();
        services.retry = config.agent.retry.clone();
        services.max_rounds = config.agent.max_rounds;
        if let Some(store) = store {
            services = services.with_store(store);
        }

        let profile = config.profile_for(AgentType::parse(agent));
        let session = Session::new(profile, services);
        session.set_callbacks(terminal_callbacks());

        Ok(Self {
            session,
            registry,
            mcp,
        })
    }

    async fn run_prompt(&self, prompt: &str) -> Result<()> {
        let reason = self.session.prompt(prompt).await?;
        println!();
        if reason != FinishReason::Stop {
            warn!(reason = reason.as_str(), "prompt did not finish cleanly");
        }
        Ok(())
    }

    async fn chat_loop(&self) -> Result<()> {
        use tokio::io::{AsyncBufReadExt, BufReader};

        println!(
            "quill {} — {} agent, {}k context. Type 'exit' to quit.",
            env!("CARGO_PKG_VERSION"),
            self.session.agent_type().as_str(),
            self.session.context_window() / 1000,
        );

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        loop {
            print!("> ");
            std::io::stdout().flush().ok();

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "exit" || line == "quit" {
                break;
            }

            if let Err(e) = self.session.prompt(line).await {
                error!(err = %e, "prompt failed");
            }
            println!();
        }

        Ok(())
    }

    async fn shutdown(&self) {
        self.mcp.disconnect_all(&self.registry).await;
    }
}

fn make_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let name = Config::provider_for_model(&config.default_model);
    let mut settings = config.providers.get(name).cloned().unwrap_or_default();
    if settings.api_key.is_none() {
        settings.api_key = config.resolve_api_key(name);
    }

    let provider: Arc<dyn Provider> = match name {
        "anthropic" => Arc::new(AnthropicProvider::new(&settings)),
        _ => Arc::new(OpenAiProvider::new(&settings)),
    };
    Ok(provider)
}

/// Callbacks that render session progress on the terminal.
fn terminal_callbacks() -> SessionCallbacks {
    SessionCallbacks {
        on_stream: Some(Box::new(|delta| {
            print!("{delta}");
            std::io::stdout().flush().ok();
        })),
        on_tool_start: Some(Box::new(|tool, args| {
            eprintln!("\n[tool] {tool} {args}");
        })),
        on_tool_end: Some(Box::new(|tool, preview, is_error| {
            if is_error {
                eprintln!("[tool] {tool} failed: {preview}");
            } else {
                eprintln!("[tool] {tool} ok: {preview}");
            }
        })),
        on_error: Some(Box::new(|message| {
            eprintln!("\n[error] {message}");
        })),
        on_complete: None,
        on_permission: Some(Box::new(ask_on_terminal)),
        on_question: None,
    }
}

/// Interactive Ask gate: y / n / a (always allow) / d (always deny).
fn ask_on_terminal(tool_id: &str, args: &serde_json::Value) -> PermissionDecision {
    eprint!("\nAllow tool '{tool_id}' with {args}? [y/N/a/d] ");
    std::io::stderr().flush().ok();

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return PermissionDecision::Deny;
    }
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => PermissionDecision::Allow,
        "a" | "always" => PermissionDecision::AlwaysAllow,
        "d" | "never" => PermissionDecision::AlwaysDeny,
        _ => PermissionDecision::Deny,
    }
}

// ---------------------------------------------------------------------------
// Config and session commands
// ---------------------------------------------------------------------------

fn run_config_command(action: ConfigAction, config: &Config) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let rendered = toml_string(config)?;
            println!("{rendered}");
            Ok(())
        }
        ConfigAction::Init => {
            let path = Config::default_path()?;
            if path.exists() {
                anyhow::bail!("config already exists at {}", path.display());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(&path, sample_config())
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

fn toml_string(config: &Config) -> Result<String> {
    // Redact API keys before display.
    let mut shown = config.clone();
    for settings in shown.providers.values_mut() {
        if settings.api_key.is_some() {
            settings.api_key = Some("<redacted>".into());
        }
    }
    Ok(toml::to_string_pretty(&shown)?)
}

async fn list_sessions() -> Result<()> {
    let store = FsMessageStore::new(&Config::config_dir()?)?;
    let metas = quill_core::MessageStore::list(&store).await?;
    if metas.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for meta in metas {
        println!(
            "{}  {}  {:>8} tok  {}",
            meta.updated_at.format("%Y-%m-%d %H:%M"),
            meta.agent_type.as_str(),
            meta.usage.total(),
            if meta.title.is_empty() { &meta.id } else { &meta.title },
        );
    }
    Ok(())
}
