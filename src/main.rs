//! brewol - autonomous coding agent entry point.
//!
//! Parses flags, resolves configuration from the environment (the only
//! place the `OLLAMA_*` variables are read), spawns the engine, and
//! renders the update stream to the terminal.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use brewol::config::{Config, LlmConfig};
use brewol::engine::{CycleUpdate, Engine, EngineState};
use brewol::llm::ThinkMode;

#[derive(Parser)]
#[command(name = "brewol")]
#[command(version)]
#[command(about = "Autonomous terminal coding agent driving a local Ollama runtime")]
#[command(after_help = "\
Environment Variables:
  OLLAMA_HOST       Ollama API base URL (default: http://localhost:11434)
  OLLAMA_MODEL      Default model to use
  OLLAMA_API_KEY    API key for cloud Ollama endpoint
  OLLAMA_KEEP_ALIVE Model keep-alive duration (passed through)

Examples:
  brewol                              Start in current directory
  brewol -w /path/to/project          Start in specified directory
  brewol -g \"Fix all failing tests\"   Start with a specific goal
  brewol -m qwen2.5-coder             Use a specific model")]
struct Cli {
    /// Workspace root directory (defaults to current directory)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Initial goal for the agent
    #[arg(short, long)]
    goal: Option<String>,

    /// Ollama model to use (overrides OLLAMA_MODEL)
    #[arg(short, long)]
    model: Option<String>,

    /// Context window override in tokens
    #[arg(long)]
    num_ctx: Option<u32>,

    /// Thinking mode
    #[arg(long, value_enum, default_value_t = ThinkMode::Auto)]
    think: ThinkMode,

    /// Inter-cycle throttle in seconds (0 = none)
    #[arg(long, default_value_t = 0)]
    speed: u64,

    /// Enable test mode (exit after max-cycles)
    #[arg(long)]
    test_mode: bool,

    /// Maximum cycles to run in test mode
    #[arg(long, default_value_t = 1)]
    max_cycles: u32,

    /// Extract shell commands from assistant markdown instead of using
    /// structured tool calls (legacy)
    #[arg(long)]
    legacy_commands: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let workspace = match cli.workspace {
        Some(path) => path,
        None => match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(e) => {
                eprintln!("{} failed to get current directory: {e}", "Error:".red());
                std::process::exit(1);
            }
        },
    };
    if !workspace.is_dir() {
        eprintln!(
            "{} workspace is not a directory: {}",
            "Error:".red(),
            workspace.display()
        );
        std::process::exit(1);
    }

    let mut llm = LlmConfig::from_env().with_think_mode(cli.think);
    if let Some(model) = cli.model {
        llm = llm.with_model(model);
    }
    if let Some(num_ctx) = cli.num_ctx {
        llm = llm.with_num_ctx(num_ctx);
    }

    if llm.model.is_none() {
        eprintln!(
            "{} No model specified. Use -m or set OLLAMA_MODEL.",
            "Warning:".yellow()
        );
        eprintln!("         Will attempt to use first available model from Ollama.\n");
    }

    let mut config = Config::new(&workspace).with_llm(llm);
    if let Some(goal) = cli.goal {
        config = config.with_goal(goal);
    }
    if cli.test_mode {
        config = config.with_test_mode(cli.max_cycles);
    }
    config.legacy_command_extraction = cli.legacy_commands;

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{} failed to create engine: {e}", "Error:".red());
            std::process::exit(1);
        }
    };

    // Probe the runtime and auto-select a model when none is configured.
    {
        let client = brewol::llm::Client::new(LlmConfig::from_env());
        if !client.is_available().await {
            eprintln!(
                "{} Ollama is not available at {}",
                "Warning:".yellow(),
                client.base_url()
            );
            eprintln!("         Make sure Ollama is running: ollama serve\n");
        }
    }

    let (handle, mut updates) = engine.spawn();

    if handle.client().model().is_none() {
        if let Ok(models) = handle.client().list_models().await {
            if let Some(first) = models.first() {
                handle.client().set_model(first.name.clone());
                handle.sync_context_size();
                eprintln!("Auto-selected model: {}\n", first.name);
            }
        }
    }
    if cli.speed > 0 {
        handle.set_speed(cli.speed);
    }

    let session_path = handle.session_path().clone();

    // Stop the engine on Ctrl-C; a second Ctrl-C aborts outright.
    let sig_handle = handle.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        sig_handle.stop();
        let _ = tokio::signal::ctrl_c().await;
        std::process::exit(130);
    });

    while let Some(update) = updates.recv().await {
        render_update(&update);
        if matches!(
            update,
            CycleUpdate::StateChange {
                state: EngineState::Terminating,
                ..
            }
        ) {
            break;
        }
    }

    println!("\nSession logs saved to: {}", session_path.display());
}

fn render_update(update: &CycleUpdate) {
    match update {
        CycleUpdate::StateChange { state, message } => {
            println!("{} {message}", format!("[{state}]").cyan().bold());
        }
        CycleUpdate::Message { state, message } => {
            println!("{} {message}", format!("[{state}]").cyan());
        }
        CycleUpdate::TokenContent { content, .. } => {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
        CycleUpdate::ThinkingContent { content } => {
            print!("{}", content.dimmed());
            let _ = std::io::stdout().flush();
        }
        CycleUpdate::TokensPerSec { tokens_per_sec } => {
            println!("\n{}", format!("({tokens_per_sec:.1} tok/s)").dimmed());
        }
        CycleUpdate::ToolResult { result } => {
            let status = if result.is_success() {
                "ok".green()
            } else {
                format!("exit {}", result.exit_code).red()
            };
            println!(
                "{} {} [{status}] {:.2}s",
                "[TOOL]".magenta(),
                result.name,
                result.duration_seconds
            );
            if let Some(error) = &result.error {
                println!("  {}", error.red());
            }
        }
        CycleUpdate::Suggestions { suggestions } => {
            println!("{}", "Suggestions:".bold());
            for suggestion in suggestions {
                let status = match suggestion.status {
                    brewol::engine::SuggestionStatus::Executing => "EXECUTING".green(),
                    brewol::engine::SuggestionStatus::Queued => "QUEUED".yellow(),
                    brewol::engine::SuggestionStatus::Skipped => "SKIPPED".dimmed(),
                };
                if suggestion.reason.is_empty() {
                    println!("  - {} [{status}]", suggestion.item);
                } else {
                    println!("  - {} [{status}: {}]", suggestion.item, suggestion.reason);
                }
            }
        }
        CycleUpdate::Error { message } => {
            eprintln!("{} {message}", "[ERROR]".red().bold());
        }
    }
}
