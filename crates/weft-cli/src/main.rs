//! weft - follow a multi-step backend conversation from the terminal

mod config;
mod render;
mod transcript_log;
mod utils;

use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use weft_api::HttpBackend;
use weft_engine::{Engine, EngineConfig, SessionEvent, SessionEventStream};

use crate::transcript_log::TranscriptLog;

/// weft - submit a query and follow its reconciled transcript
#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Query to submit (interactive mode when omitted)
    query: Option<String>,

    /// Follow an existing conversation instead of submitting a query
    #[arg(short, long, conflicts_with = "query")]
    watch: Option<String>,

    /// Backend base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Milliseconds between status polls
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Extra polls after the conversation reports a terminal status
    #[arg(long)]
    grace_polls: Option<u32>,

    /// Stop polling as soon as a final answer is shown
    #[arg(long)]
    stop_on_final: bool,

    /// Upper bound on polls per conversation
    #[arg(long)]
    max_polls: Option<u32>,

    /// Print events as JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// Write a JSONL transcript log
    #[arg(long)]
    log: bool,

    /// List saved transcript logs
    #[arg(long)]
    history: bool,

    /// Print a saved transcript log by ID
    #[arg(long)]
    replay: Option<String>,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout only carries the transcript
    let filter = if args.verbose {
        EnvFilter::new("weft=debug,weft_api=debug,weft_engine=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    if args.history {
        return list_history();
    }

    if let Some(ref id) = args.replay {
        return replay(id);
    }

    let mut cfg = config::Config::load();
    if let Some(ref url) = args.base_url {
        cfg.base_url = Some(url.clone());
    }
    if let Some(ms) = args.interval_ms {
        cfg.poll_interval_ms = Some(ms);
    }
    if let Some(n) = args.grace_polls {
        cfg.grace_polls = Some(n);
    }
    if args.stop_on_final {
        cfg.stop_on_final = Some(true);
    }
    if let Some(n) = args.max_polls {
        cfg.max_polls = Some(n);
    }

    let backend_config = cfg.backend_config();
    let base_url = backend_config.base_url.clone();
    let backend = HttpBackend::new(backend_config)?;
    let engine = Engine::new(
        Arc::new(backend),
        EngineConfig {
            policy: cfg.poll_policy(),
            ..Default::default()
        },
    );

    let log = if args.log || cfg.log_transcripts.unwrap_or(false) {
        match TranscriptLog::create(&base_url) {
            Ok(log) => {
                if args.verbose {
                    eprintln!("Logging transcript {} to {}", log.id(), log.path().display());
                }
                Some(log)
            }
            Err(e) => {
                eprintln!("Warning: could not create transcript log: {}", e);
                None
            }
        }
    } else {
        None
    };

    let printer = tokio::spawn(print_events(engine.events(), args.json, args.verbose, log));

    if let Some(ref conversation_id) = args.watch {
        let handle = engine.watch(conversation_id)?;
        handle.wait_for_stop().await;
    } else if let Some(ref query) = args.query {
        match engine.submit(query).await {
            Ok(handle) => handle.wait_for_stop().await,
            Err(e) => {
                eprintln!("Could not submit query: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        run_interactive(&engine).await?;
    }

    engine.shutdown().await;

    // Wait a bit for final events
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    printer.abort();

    Ok(())
}

async fn print_events(
    mut events: SessionEventStream,
    json: bool,
    verbose: bool,
    mut log: Option<TranscriptLog>,
) {
    while let Some(event) = events.next().await {
        if let Some(ref mut log) = log {
            let written = match &event {
                SessionEvent::EntryAppended { entry } => log.append(entry),
                SessionEvent::EntryUpdated { entry } => log.update(entry),
                _ => Ok(()),
            };
            if let Err(e) = written {
                tracing::warn!("Failed to write transcript log: {}", e);
            }
        }

        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
        } else if let Some(text) = render::render_event(&event, verbose) {
            println!("{}", text);
        }
    }
}

async fn run_interactive(engine: &Engine) -> anyhow::Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!("weft: type a query; a new query replaces the one being followed.");
        eprintln!("Commands: /stop, /status, /quit");
        eprintln!();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/stop" => match engine.current() {
                Some(id) if engine.stop(&id) => eprintln!("Stopped following {}", id),
                _ => eprintln!("Nothing is being followed."),
            },
            "/status" => match engine.current().and_then(|id| engine.session(&id)) {
                Some(handle) => {
                    let state = handle.polling_state();
                    eprintln!(
                        "{}: {} polls, {}",
                        handle.conversation_id(),
                        state.total_polls,
                        if handle.is_running() { "polling" } else { "stopped" }
                    );
                }
                None => eprintln!("Nothing is being followed."),
            },
            query => {
                if let Err(e) = engine.submit(query).await {
                    eprintln!("Could not submit query: {}", e);
                }
            }
        }
    }
    Ok(())
}

fn list_history() -> anyhow::Result<()> {
    match TranscriptLog::list() {
        Ok(logs) => {
            if logs.is_empty() {
                println!("No saved transcripts found.");
                println!(
                    "Transcripts are stored in: {}",
                    TranscriptLog::logs_dir().display()
                );
            } else {
                println!("Saved transcripts:\n");
                println!(
                    "{:<38} {:<20} {:<8} {:<42} Backend",
                    "ID", "Created", "Entries", "First query"
                );
                println!("{}", "-".repeat(120));
                for log in logs {
                    println!(
                        "{:<38} {:<20} {:<8} {:<42} {}",
                        log.id,
                        log.created_at_display(),
                        log.entry_count,
                        utils::truncate_chars(log.first_query.as_deref().unwrap_or("-"), 39),
                        log.base_url
                    );
                }
                println!("\nShow with: weft --replay <id>");
            }
        }
        Err(e) => {
            eprintln!("Error listing transcripts: {}", e);
        }
    }
    Ok(())
}

fn replay(id: &str) -> anyhow::Result<()> {
    let path = TranscriptLog::path_for(id)
        .ok_or_else(|| anyhow::anyhow!("Not a transcript id: {}", id))?;
    let entries = TranscriptLog::replay(&path)
        .map_err(|e| anyhow::anyhow!("Could not read transcript {}: {}", id, e))?;
    for entry in &entries {
        println!("{}", render::render_entry(entry));
    }
    Ok(())
}
