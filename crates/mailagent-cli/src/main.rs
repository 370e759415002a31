//! MailAgent CLI
//!
//! Chat with a mail account from the terminal. The model plans capability
//! calls (search, read, send) which run against the configured MCP provider.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use mailagent_core::config::Config;
use mailagent_core::conversation::{ConversationStore, TurnRecord};
use mailagent_core::credentials::seed_refresh_token;
use mailagent_core::llm::OllamaClient;
use mailagent_core::registry::ToolRegistry;
use mailagent_core::session::{session_log_path, SessionManager};
use mailagent_core::{AgentEvent, TurnOutcome};

#[derive(Parser)]
#[command(name = "mailagent")]
#[command(about = "MailAgent - chat with your mailbox through an LLM that calls mail capabilities")]
#[command(long_about = "MailAgent answers questions about a mail account and sends mail on request.
The model proposes capability calls (list, search, read, send); each call is validated,
authorized with a short-lived bearer token and sent to the configured MCP provider.

QUICK START:
  1. Seed a refresh token:  mailagent seed-token --session work <refresh-token>
  2. Start chatting:        mailagent chat --session work
  3. Review the log:        mailagent history --session work --human

OUTPUT FORMAT:
  history and capabilities output JSON by default. Add --human for terminal reading.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/mailagent/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output in human-readable format instead of JSON
    #[arg(long, global = true)]
    human: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat. Ctrl-C stops the running answer; /quit or Ctrl-D exits.
    Chat {
        /// Session to resume; a new one is created when omitted
        #[arg(long)]
        session: Option<String>,
    },
    /// Print the persisted conversation log of a session
    History {
        #[arg(long)]
        session: String,
    },
    /// List the capabilities the model may call
    Capabilities,
    /// Store the initial refresh token for a session (no consent flow)
    SeedToken {
        #[arg(long)]
        session: String,
        /// OAuth refresh token
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::load().unwrap_or_default(),
    };
    init_logging(&config)?;

    match cli.command {
        Commands::Chat { session } => chat(config, session).await,
        Commands::History { session } => history(&config, &session, cli.human).await,
        Commands::Capabilities => capabilities(cli.human),
        Commands::SeedToken { session, token } => seed_token(&config, &session, &token, cli.human),
    }
}

/// Log to a daily file; stdout belongs to the chat
fn init_logging(config: &Config) -> Result<()> {
    let log_dir = config.logs_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "mailagent.log");
    let filter = EnvFilter::try_new(&config.general.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(file_layer.with_filter(filter))
        .init();
    Ok(())
}

// ============================================================================
// Chat
// ============================================================================

async fn chat(config: Config, session: Option<String>) -> Result<()> {
    let model = OllamaClient::new(&config.llm);
    if !model.is_available().await {
        eprintln!(
            "warning: model server at {} is not reachable; answers will fail until it is",
            config.llm.base_url
        );
    }

    let manager = SessionManager::from_config(Arc::new(config)).await?;
    let session = match manager.open(session.as_deref()).await {
        Ok(session) => session,
        Err(e) => {
            if let Some(hint) = e.action_hint() {
                eprintln!("{}", hint);
            }
            return Err(e.into());
        }
    };

    info!("Chat started for session {}", session.id());
    println!("Session {} ({} turns). /quit to exit.", session.id(), session.agent().store().len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" || text == "/exit" {
            break;
        }

        let outcome = run_turn(&manager, session.id(), text).await?;
        if outcome == TurnOutcome::ReauthRequired {
            eprintln!(
                "Re-authorize this mailbox, then run: mailagent seed-token --session {} <refresh-token>",
                session.id()
            );
            break;
        }
    }

    manager.close(session.id())?;
    Ok(())
}

/// Submit one user message and render its events until the turn ends
async fn run_turn(manager: &SessionManager, session_id: &str, text: &str) -> Result<TurnOutcome> {
    let (mut events, handle) = manager.submit(session_id, text).await?;
    let mut view = TurnView::default();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => view.show(event)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !view.stopping => {
                view.stopping = true;
                handle.stop();
            }
        }
    }

    let outcome = handle.finished().await;
    if outcome == TurnOutcome::LimitReached {
        warn!("Turn in session {} hit the round limit", session_id);
    }
    Ok(outcome)
}

#[derive(Default)]
struct TurnView {
    /// Tokens were printed without a trailing newline
    mid_line: bool,
    streamed: bool,
    stopping: bool,
}

impl TurnView {
    fn show(&mut self, event: AgentEvent) -> Result<()> {
        let mut out = std::io::stdout();
        match event {
            AgentEvent::AssistantToken(token) => {
                print!("{}", token);
                out.flush()?;
                self.mid_line = !token.ends_with('\n');
                self.streamed = true;
            }
            AgentEvent::ToolCallStarted { call_id, capability } => {
                self.break_line();
                println!("  → {} [{}]", capability, call_id);
                // Text streamed before tool calls is planning, not the answer
                self.streamed = false;
            }
            AgentEvent::ToolCallFinished { capability, result, .. } => {
                self.break_line();
                match result {
                    Ok(summary) => println!("  ← {} {}", capability, summary),
                    Err(e) => println!("  ✗ {} [{}] {}", capability, e.code(), e),
                }
            }
            AgentEvent::TurnComplete { text } => {
                if !self.streamed {
                    self.break_line();
                    print!("{}", text);
                }
                println!();
                self.mid_line = false;
            }
            AgentEvent::Error { code, message } => {
                self.break_line();
                eprintln!("error [{}]: {}", code, message);
            }
        }
        Ok(())
    }

    fn break_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

// ============================================================================
// History, capabilities, tokens
// ============================================================================

async fn history(config: &Config, session_id: &str, human: bool) -> Result<()> {
    let path = session_log_path(config, session_id);
    if !path.exists() {
        bail!("No conversation log for session {} at {:?}", session_id, path);
    }

    let store = ConversationStore::load(session_id, &path).await?;
    let records = store.snapshot();

    if human {
        println!("Session {} ({} turns)", session_id, records.len());
        for record in &records {
            println!("{}", render_human(record));
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&records)?);
    }
    Ok(())
}

fn render_human(record: &TurnRecord) -> String {
    format!(
        "{} #{:<4} {}",
        record.at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
        record.seq,
        record.render()
    )
}

fn capabilities(human: bool) -> Result<()> {
    let registry = ToolRegistry::mail();
    let definitions = registry.definitions();

    if human {
        for descriptor in definitions {
            let kind = if descriptor.idempotent { "read" } else { "write" };
            println!("{:<22} {:<6} {}", descriptor.name, kind, descriptor.description);
        }
    } else {
        let list: Vec<_> = definitions
            .iter()
            .map(|d| {
                json!({
                    "name": d.name,
                    "description": d.description,
                    "idempotent": d.idempotent,
                    "input_schema": d.input_schema,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    }
    Ok(())
}

fn seed_token(config: &Config, session_id: &str, token: &str, human: bool) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        bail!("Refresh token must not be empty");
    }
    let path = seed_refresh_token(&config.credentials_dir(), session_id, token)?;

    if human {
        println!("Stored refresh token for session {} at {}", session_id, path.display());
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "session": session_id,
                "path": path,
            }))?
        );
    }
    Ok(())
}
