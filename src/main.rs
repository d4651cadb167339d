use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maestro_agent::{HandlerRegistry, LlmClassifier, Orchestrator, DEFAULT_CALLER};
use maestro_core::config::AppConfig;
use maestro_core::traits::LlmClient;
use maestro_core::types::{StreamEvent, StreamEventKind};
use maestro_core::MaestroError;
use maestro_memory::InteractionLog;

#[derive(Parser)]
#[command(name = "maestro", version, about = "Multi-agent request orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive REPL mode
    Repl,
    /// Run a single request and exit
    Run {
        /// Wait for the full reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
        /// Print the nodes the request went through
        #[arg(long)]
        trace: bool,
        /// The request text (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Inspect or clear the conversation history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Inspect the interaction log
    Interactions {
        #[command(subcommand)]
        action: InteractionAction,
    },
    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Print stored messages
    Show {
        /// Only the last N messages
        #[arg(long)]
        last: Option<usize>,
    },
    /// Message counts per role and agent
    Stats,
    /// Delete the history and its file
    Clear,
}

#[derive(Subcommand)]
enum InteractionAction {
    /// Counts per task type and agent
    Stats,
    /// Print the most recent interactions
    Recent {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Drop interactions older than the given number of days
    Cleanup {
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("maestro=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: {} not found, using defaults and environment variables",
            cli.config.display()
        );
        create_env_config()?
    };

    match cli.command {
        Some(Commands::Config) => {
            let mut shown = config.clone();
            if shown.model.api_key.is_some() {
                shown.model.api_key = Some("********".to_string());
            }
            println!("{}", toml::to_string_pretty(&shown)?);
            return Ok(());
        }
        Some(Commands::Interactions { action }) => {
            return handle_interactions(action, &config).await;
        }
        _ => {}
    }

    let orchestrator = build_orchestrator(&config)?;
    match orchestrator.load_history().await {
        Ok(0) => {}
        Ok(count) => info!(messages = count, "Conversation history restored"),
        Err(e) => warn!(error = %e, "Could not restore conversation history, starting empty"),
    }

    match cli.command {
        Some(Commands::Run {
            no_stream,
            trace,
            prompt,
        }) => {
            let text = prompt.join(" ");
            let input = if text.is_empty() {
                io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                text
            };
            if no_stream || trace {
                let report = orchestrator.execute(DEFAULT_CALLER, &input).await?;
                println!("{}", report.reply);
                if trace {
                    match report.state {
                        Some(state) => {
                            let path: Vec<&str> = state.workflow_path.iter().map(|n| n.as_str()).collect();
                            eprintln!("[path: {}]", path.join(" -> "));
                            if state.classification_fallback {
                                eprintln!("[classification fell back to chat]");
                            }
                            for warning in &state.warnings {
                                eprintln!("[warning: {}]", warning.message);
                            }
                            let metrics = orchestrator.metrics().snapshot();
                            if let Some(handler) = state
                                .selected_handler
                                .as_ref()
                                .and_then(|id| metrics.handlers.get(id.as_str()))
                            {
                                eprintln!("[took {:.0} ms]", handler.avg_duration_ms);
                            }
                        }
                        None => eprintln!("[served from cache]"),
                    }
                }
            } else {
                stream_once(&orchestrator, &input).await?;
            }
        }
        Some(Commands::History { action }) => handle_history(action, &orchestrator).await?,
        Some(Commands::Repl) | None => run_repl(&orchestrator, &config).await?,
        Some(Commands::Config) | Some(Commands::Interactions { .. }) => {}
    }

    Ok(())
}

fn build_orchestrator(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let llm: Arc<dyn LlmClient> = Arc::from(maestro_llm::create_resilient_client(&config.model));
    let registry = HandlerRegistry::with_llm(llm.clone(), &config.model);
    let classifier = Arc::new(LlmClassifier::new(llm, &config.model));
    Ok(Orchestrator::new(registry, classifier, config)?)
}

/// Stream one request to stdout. Status and error events go to stderr.
async fn stream_once(orchestrator: &Orchestrator, input: &str) -> anyhow::Result<()> {
    let mut events = orchestrator.run_streaming(input).await?;
    let mut stdout = io::stdout();

    while let Some(event) = events.next().await {
        print_event(&event, &mut stdout)?;
    }
    println!();
    Ok(())
}

fn print_event(event: &StreamEvent, stdout: &mut io::Stdout) -> io::Result<()> {
    match event.kind {
        StreamEventKind::Status => eprintln!("[{}] {}", event.agent, event.content),
        StreamEventKind::Chunk => {
            write!(stdout, "{}", event.content)?;
            stdout.flush()?;
        }
        StreamEventKind::Complete => {}
        StreamEventKind::Error => eprintln!("\n[error] {}", event.content),
    }
    Ok(())
}

async fn run_repl(orchestrator: &Orchestrator, config: &AppConfig) -> anyhow::Result<()> {
    println!("Maestro v{}", env!("CARGO_PKG_VERSION"));
    println!("Model: {} ({})", config.model.model_id, config.model.provider);
    println!("Type /help for commands, /quit to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let parts: Vec<&str> = input.split_whitespace().collect();
        match parts[0] {
            "/quit" | "/exit" | "/q" => {
                println!("Goodbye!");
                break;
            }
            "/help" => {
                println!("/history [n]  show the last n messages (default 10)");
                println!("/stats        history, cache and request statistics");
                println!("/limit <n>    change the history window");
                println!("/clear        clear history and cache");
                println!("/quit         exit");
                continue;
            }
            "/clear" => {
                orchestrator.history().clear().await?;
                orchestrator.cache().clear();
                println!("History and cache cleared.");
                continue;
            }
            "/history" => {
                let count = parts.get(1).and_then(|n| n.parse().ok()).unwrap_or(10);
                print!("{}", orchestrator.history().recent_context(count));
                println!();
                continue;
            }
            "/stats" => {
                println!("History: {}", serde_json::to_string_pretty(&orchestrator.history().stats())?);
                println!("Cache: {}", serde_json::to_string_pretty(&orchestrator.cache().stats())?);
                println!("Requests: {}", serde_json::to_string_pretty(&orchestrator.metrics().snapshot())?);
                continue;
            }
            "/limit" => {
                match parts.get(1).and_then(|n| n.parse::<usize>().ok()).filter(|n| *n > 0) {
                    Some(limit) => {
                        orchestrator.history().set_max_messages(limit);
                        println!("History window set to {} messages.", limit);
                    }
                    None => println!("Usage: /limit <n>, n >= 1"),
                }
                continue;
            }
            _ => {}
        }

        match stream_once(orchestrator, input).await {
            Ok(()) => {}
            Err(e) => match e.downcast_ref::<MaestroError>() {
                Some(MaestroError::RateLimited { retry_after_secs }) => {
                    println!("Rate limit reached, try again in {:.0}s.", retry_after_secs.ceil())
                }
                Some(rejection) if rejection.is_rejection() => println!("Input rejected: {}", rejection),
                _ => eprintln!("Error: {}", e),
            },
        }
    }

    Ok(())
}

async fn handle_history(action: HistoryAction, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let history = orchestrator.history();
    match action {
        HistoryAction::Show { last } => {
            let messages = history.messages();
            let start = last.map(|n| messages.len().saturating_sub(n)).unwrap_or(0);
            for message in &messages[start..] {
                println!("{}", serde_json::to_string(message)?);
            }
        }
        HistoryAction::Stats => {
            let report = serde_json::json!({
                "history": history.stats(),
                "requests": orchestrator.metrics().snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        HistoryAction::Clear => {
            history.clear().await?;
            println!("Conversation history cleared.");
        }
    }
    Ok(())
}

async fn handle_interactions(action: InteractionAction, config: &AppConfig) -> anyhow::Result<()> {
    let log = InteractionLog::new(config.data.interactions_file.clone());
    match action {
        InteractionAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&log.stats().await?)?);
        }
        InteractionAction::Recent { limit } => {
            for interaction in log.recent(limit).await? {
                println!("{}", serde_json::to_string(&interaction)?);
            }
        }
        InteractionAction::Cleanup { days } => {
            let removed = log.cleanup_older_than(days).await?;
            println!("Removed {} interaction(s) older than {} days.", removed, days);
        }
    }
    Ok(())
}

/// Defaults, with the model endpoint taken from the environment.
fn create_env_config() -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::default();

    if let Ok(key) = std::env::var("AZURE_OPENAI_API_KEY") {
        config.model.provider = "azure".to_string();
        config.model.api_key = Some(key);
        config.model.base_url = std::env::var("AZURE_OPENAI_ENDPOINT").ok();
        config.model.azure_deployment = std::env::var("AZURE_OPENAI_DEPLOYMENT").ok();
        config.model.azure_api_version = std::env::var("AZURE_OPENAI_API_VERSION").ok();
    } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        config.model.provider = "openai".to_string();
        config.model.api_key = Some(key);
        config.model.base_url = std::env::var("OPENAI_BASE_URL").ok();
    } else {
        eprintln!("Warning: neither AZURE_OPENAI_API_KEY nor OPENAI_API_KEY is set");
    }

    config.validate()?;
    Ok(config)
}
