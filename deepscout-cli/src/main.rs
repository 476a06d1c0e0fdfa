//! deepscout command-line interface.
//!
//! Parses a research query, wires the component graph from configuration,
//! runs a single research session, and streams its events to the terminal
//! as human-readable lines or JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use deepscout_core::{
    BrowserEngine, CaptchaSolver, Fetcher, HashEmbedder, HttpCaptchaSolver, ResearchEvent,
    ResearchOrchestrator, ResearchOutcome, ScoutConfig, SourceRegistry, SqliteContentStore,
    build_http_client, create_provider, load_config,
};

#[derive(Parser, Debug)]
#[command(name = "deepscout", version, about = "Iterative topic research from the command line", long_about = None)]
struct Cli {
    /// Research query to investigate.
    query: String,

    /// Scenario tag (e.g. "technology", "paper"); omit to let the engine
    /// pick one from the first sufficiency verdict.
    #[arg(short, long)]
    scenario: Option<String>,

    /// Path to a config file (defaults to ./deepscout.toml when present).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit events and the final outcome as JSON lines.
    #[arg(long)]
    json: bool,

    /// Override the iteration cap for this session.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Override the evidence target for this session.
    #[arg(long)]
    target: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = PathBuf::from(".deepscout/logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "deepscout.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    // Load configuration and apply CLI overrides
    let mut config = load_config(cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    if let Some(cap) = cli.max_iterations {
        config.budget.max_iterations = cap;
    }
    if let Some(target) = cli.target {
        config.budget.target_results = target;
    }
    for warning in config.validate() {
        warn!("config: {warning}");
    }

    let cancel = CancellationToken::new();
    let initial_scenario = cli.scenario.as_deref().unwrap_or("general");
    let orchestrator = build_orchestrator(&config, initial_scenario, cancel.clone())?;

    // Ctrl-C cancels the session; the loop drains and returns partial evidence.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping after the current step");
                cancel.cancel();
            }
        });
    }

    if !cli.json {
        match &cli.scenario {
            Some(tag) => println!("Researching \"{}\" (scenario: {tag})", cli.query),
            None => println!("Researching \"{}\"", cli.query),
        }
    }

    let (mut events, handle) = orchestrator.start_research(cli.query.clone(), cli.scenario.clone());
    while let Some(event) = events.next().await {
        print_event(&event, cli.json);
    }

    let outcome = handle
        .await
        .map_err(|e| anyhow::anyhow!("research task failed: {e}"))?;
    print_outcome(&outcome, cli.json);

    Ok(())
}

/// Builds the full component graph from configuration.
///
/// The content store collection comes from the scenario the session starts
/// under; auto-detected sessions write to the `general` collection.
fn build_orchestrator(
    config: &ScoutConfig,
    initial_scenario: &str,
    cancel: CancellationToken,
) -> anyhow::Result<Arc<ResearchOrchestrator>> {
    let model = create_provider(&config.llm)?;
    let registry = Arc::new(SourceRegistry::with_defaults(
        &config.crawler,
        &config.search,
    )?);

    #[cfg(feature = "browser")]
    let engine: Arc<dyn BrowserEngine> =
        Arc::new(deepscout_core::ChromiumEngine::new(&config.crawler));
    #[cfg(not(feature = "browser"))]
    let engine: Arc<dyn BrowserEngine> = Arc::new(deepscout_core::DisabledBrowserEngine);

    let solver: Option<Arc<dyn CaptchaSolver>> = match &config.crawler.captcha_api_key_env {
        Some(env_name) => match std::env::var(env_name) {
            Ok(key) if !key.is_empty() => {
                let client = build_http_client(config.crawler.fetch_timeout_secs, None)?;
                Some(Arc::new(HttpCaptchaSolver::new(client, key)))
            }
            _ => {
                warn!(env = %env_name, "challenge solver key not set; challenges will fail");
                None
            }
        },
        None => None,
    };

    let http = build_http_client(config.crawler.fetch_timeout_secs, None)?;
    let fetcher = Fetcher::new(
        Arc::clone(&engine),
        Arc::clone(&registry),
        solver,
        http,
        &config.crawler,
    );

    let profile = config.scenario(initial_scenario);
    let store = Arc::new(SqliteContentStore::new(
        &config.store.db_path,
        &profile.collection,
    )?);
    let embedder = Arc::new(HashEmbedder::new(config.store.embedding_dimensions));

    Ok(Arc::new(ResearchOrchestrator::new(
        model,
        registry,
        fetcher,
        store,
        embedder,
        config.clone(),
        cancel,
    )))
}

fn print_event(event: &ResearchEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }
    match event {
        ResearchEvent::Status {
            phase,
            iteration,
            message,
        } => println!("[iter {iteration}] {phase}: {message}"),
        ResearchEvent::Evidence { url, title, tokens } => {
            println!("  + {title} ({tokens} tokens)\n    {url}");
        }
        ResearchEvent::Error { message, url } => match url {
            Some(url) => eprintln!("  ! {message} ({url})"),
            None => eprintln!("  ! {message}"),
        },
    }
}

fn print_outcome(outcome: &ResearchOutcome, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(outcome) {
            println!("{line}");
        }
        return;
    }
    println!(
        "\nCollected {} evidence item(s) over {} iteration(s): {}.",
        outcome.evidence.len(),
        outcome.iterations,
        outcome.reason
    );
    for item in &outcome.evidence {
        println!("  - {}\n    {}", item.title, item.url);
    }
}
