mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use runtime::providers::AnthropicBackend;
use runtime::{
    Orchestrator, Session, ToolRegistry, TurnObserver, TurnOutcome, builtin_tools,
    model::ToolResult,
};
use storage::{Event, EventKind, EventStore, Role};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

const SYSTEM_PROMPT: &str = "You are Helmsman, a helpful AI assistant. Be concise and direct.";
const CONFIG_FILE: &str = "helmsman.toml";

#[derive(Parser)]
#[command(name = "helmsman")]
#[command(about = "A streaming tool-calling agent shell", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat,
    /// List all sessions
    Sessions {
        /// Show only the last N sessions
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show event logs for a session
    Logs {
        /// Session ID (prefix match supported)
        #[arg(short, long)]
        session: String,
        /// Filter by event kind (message, tool_call, tool_result)
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// List the tools the registry currently loads
    Tools,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Chat) | None => cmd_chat().await,
        Some(Commands::Sessions { limit }) => cmd_sessions(limit),
        Some(Commands::Logs { session, kind }) => cmd_logs(&session, kind.as_deref()),
        Some(Commands::Tools) => cmd_tools().await,
    }
}

fn load_config() -> Result<Config> {
    if std::path::Path::new(CONFIG_FILE).exists() {
        Config::load(CONFIG_FILE).map_err(|e| Error::Config(e.to_string()))
    } else {
        Ok(Config::default())
    }
}

async fn cmd_chat() -> Result<()> {
    println!("helmsman v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let auth = config.auth().map_err(|e| Error::Config(e.to_string()))?;
    let backend = AnthropicBackend::builder(auth).build();

    // Merge builtin tools with every configured tool server.
    let registry = Arc::new(ToolRegistry::new(
        builtin_tools(),
        config.tool_servers.clone(),
    ));
    let snapshot = registry.load().await;
    println!(
        "Tools: {} loaded ({} server{} configured)",
        snapshot.len(),
        config.tool_servers.len(),
        if config.tool_servers.len() == 1 { "" } else { "s" }
    );

    let data_dir = dirs_data_dir().unwrap_or_else(|| ".helmsman".into());
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("events.db");
    let store = EventStore::open(&db_path)?;
    println!("Session stored at: {}", db_path.display());

    let session_config = config.session_config();
    let model = session_config.model.clone();
    let mut session = Session::new(store, session_config)?.with_system(SYSTEM_PROMPT);
    println!("Session ID: {}", session.id);
    println!("Model: {model}");
    println!("Type 'quit' or Ctrl+D to exit; /reload refreshes tools; /reset clears history.\n");

    let orchestrator = Orchestrator::new(backend, Arc::clone(&registry));
    let observer = ConsoleObserver::new();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }
        if input == "/reload" {
            let snapshot = registry.reload().await;
            println!("Reloaded: {} tools (v{}).\n", snapshot.len(), snapshot.version());
            continue;
        }
        if input == "/reset" {
            session.reset();
            println!("History cleared.\n");
            continue;
        }

        // Ctrl+C cancels the in-flight turn, not the whole shell.
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                guard.cancel();
            }
        });

        observer.begin_turn();
        let outcome = orchestrator
            .run_turn(&mut session, input, &observer, &cancel)
            .await;
        signal.abort();

        match outcome {
            Ok(TurnOutcome::Completed { .. }) => println!("\n"),
            Ok(TurnOutcome::TurnLimitReached { rounds }) => {
                println!("\n[stopped after {rounds} tool rounds]\n");
            }
            Err(runtime::Error::Cancelled) => println!("\n[cancelled]\n"),
            Err(e) => eprintln!("\nError: {e}\n"),
        }
    }

    registry.shutdown().await;
    session.end()?;
    println!("\nSession ended.");
    Ok(())
}

async fn cmd_tools() -> Result<()> {
    let config = load_config()?;
    let registry = ToolRegistry::new(builtin_tools(), config.tool_servers);
    let snapshot = registry.load().await;

    if snapshot.is_empty() {
        println!("No tools loaded.");
    } else {
        println!("{:<28}  {:<12}  DESCRIPTION", "TOOL", "SOURCE");
        println!("{}", "-".repeat(80));
        for spec in snapshot.specs() {
            let source = snapshot
                .get(&spec.name)
                .and_then(|b| b.server())
                .unwrap_or("local");
            println!("{:<28}  {:<12}  {}", spec.name, source, spec.description);
        }
    }

    registry.shutdown().await;
    Ok(())
}

fn cmd_sessions(limit: usize) -> Result<()> {
    let store = open_store()?;
    let sessions = store.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<8}  STATUS",
        "SESSION ID", "STARTED", "MSGS"
    );
    println!("{}", "-".repeat(80));

    for summary in sessions.into_iter().take(limit) {
        let started = Local
            .from_utc_datetime(&summary.started_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        let status = if summary.ended_at.is_some() {
            "ended"
        } else {
            "active"
        };
        println!(
            "{:<36}  {:<20}  {:<8}  {status}",
            summary.id, started, summary.message_count
        );
    }

    Ok(())
}

fn cmd_logs(session_prefix: &str, kind_filter: Option<&str>) -> Result<()> {
    let store = open_store()?;

    // Find session by prefix
    let sessions = store.list_sessions()?;
    let matching: Vec<_> = sessions
        .iter()
        .filter(|s| s.id.to_string().starts_with(session_prefix))
        .collect();

    let session_id = match matching.len() {
        0 => {
            return Err(Error::SessionNotFound {
                prefix: session_prefix.to_string(),
            });
        }
        1 => matching[0].id,
        _ => {
            return Err(Error::AmbiguousSession {
                prefix: session_prefix.to_string(),
                matches: matching.iter().map(|s| s.id.to_string()).collect(),
            });
        }
    };

    let events = store.load_events(session_id, kind_filter)?;

    if events.is_empty() {
        println!("No events found for session {session_id}");
        return Ok(());
    }

    println!("Session: {session_id}\n");

    for event in events {
        print_event(&event);
    }

    Ok(())
}

fn print_event(event: &Event) {
    let time = Local
        .from_utc_datetime(&event.timestamp.naive_utc())
        .format("%H:%M:%S");

    match &event.kind {
        EventKind::SessionStart => {
            println!("[{time}] === Session started ===");
        }
        EventKind::SessionEnd => {
            println!("[{time}] === Session ended ===");
        }
        EventKind::Message { role, content } => {
            let role_str = match role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
                Role::System => "SYSTEM",
            };
            let display_content = truncate(content, 200);
            println!("[{time}] {role_str}: {display_content}");
        }
        EventKind::ToolCall {
            call_id,
            name,
            input,
            round,
        } => {
            println!("[{time}] TOOL CALL [{call_id}] round {round}: {name} {input}");
        }
        EventKind::ToolResult {
            call_id,
            status,
            payload,
            duration_ms,
        } => {
            let display_payload = truncate(payload, 200);
            println!(
                "[{time}] TOOL RESULT [{call_id}] {status} ({duration_ms}ms): {display_payload}"
            );
        }
        EventKind::TurnCompleted {
            rounds,
            input_tokens,
            output_tokens,
        } => {
            println!(
                "[{time}] TURN COMPLETED: {rounds} tool rounds, {input_tokens} in / {output_tokens} out tokens"
            );
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() > max {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &text[..cut])
    } else {
        text.to_string()
    }
}

fn open_store() -> Result<EventStore> {
    let data_dir = dirs_data_dir().unwrap_or_else(|| ".helmsman".into());
    let db_path = data_dir.join("events.db");

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    Ok(EventStore::open(&db_path)?)
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/helmsman"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("helmsman"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("helmsman"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

/// Prints stream fragments as they arrive.
struct ConsoleObserver {
    state: Mutex<ObserverState>,
}

#[derive(Default)]
struct ObserverState {
    in_thinking: bool,
}

impl ConsoleObserver {
    fn new() -> Self {
        Self {
            state: Mutex::new(ObserverState::default()),
        }
    }

    fn begin_turn(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.in_thinking = false;
        }
        println!();
    }

    fn leave_thinking(&self) {
        if let Ok(mut state) = self.state.lock()
            && state.in_thinking
        {
            state.in_thinking = false;
            println!();
        }
    }
}

impl TurnObserver for ConsoleObserver {
    fn text_delta(&self, delta: &str) {
        self.leave_thinking();
        print!("{delta}");
        let _ = io::stdout().flush();
    }

    fn thinking_delta(&self, delta: &str) {
        if let Ok(mut state) = self.state.lock() {
            if !state.in_thinking {
                state.in_thinking = true;
                print!("\n[thinking] ");
            }
        }
        print!("{delta}");
        let _ = io::stdout().flush();
    }

    fn tool_started(&self, _id: &str, name: &str) {
        self.leave_thinking();
        println!("\n[tool] {name} ...");
    }

    fn tool_finished(&self, name: &str, result: &ToolResult) {
        println!(
            "[tool] {name} -> {} ({}ms)",
            result.status,
            result.elapsed.as_millis()
        );
    }
}
