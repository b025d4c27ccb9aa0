//! # News Relay
//!
//! A long-running orchestrator that discovers articles from several news
//! sources and drives each one through an external fetch + rewrite + publish
//! step, surviving failures and restarts.
//!
//! ## Features
//!
//! - Two-level scheduling: source discovery and article processing run under
//!   separate concurrency caps
//! - Priority queue of articles weighted by source and URL category
//! - Progressive backoff with an attempt cap and advisory error diagnosis
//! - One pooled HTTP client per source, restarted when idle or under memory pressure
//! - Periodic JSON snapshots, resumed on restart when fresh
//! - Stuck-task detection and a progress feed for `news_relay status`
//!
//! ## Usage
//!
//! ```sh
//! news_relay run -c news_relay.yaml
//! news_relay status -c news_relay.yaml
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: each source's index page is scanned for article links
//! 2. **Queueing**: new URLs are deduplicated and prioritized
//! 3. **Processing**: the configured command rewrites each article
//! 4. **Recovery**: failures back off and retry; state is snapshotted throughout

use clap::Parser;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod collaborators;
mod config;
mod model;
mod monitor;
mod orchestrator;
mod pool;
mod priority;
mod retry;
mod scheduler;
mod snapshot;
mod state;
mod utils;

use cli::{Cli, Command, RunArgs, StatusArgs};
use collaborators::command::CommandProcessor;
use collaborators::diagnosis::KeywordDiagnoser;
use collaborators::http::{HttpClientFactory, IndexPageDiscoverer};
use config::{ConfigError, OrchestratorConfig};
use orchestrator::{Collaborators, Orchestrator, StartMode};
use pool::ProcessMemoryProbe;
use priority::WeightedPriority;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    match args.command {
        Command::Run(run) => run_orchestrator(run).await,
        Command::Status(status) => print_status(status).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    match path {
        Some(path) => OrchestratorConfig::load(path),
        None => {
            warn!("No config file given; using defaults");
            Ok(OrchestratorConfig::default())
        }
    }
}

#[instrument(level = "info", skip_all)]
async fn run_orchestrator(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let start_time = std::time::Instant::now();
    info!("news_relay starting up");

    let mut config = load_config(args.config.as_deref())?;
    if let Some(n) = args.max_concurrent_sources {
        config.max_concurrent_sources = n;
    }
    if let Some(n) = args.max_concurrent_articles {
        config.max_concurrent_articles = n;
    }
    config.validate()?;

    let processor = config
        .processor
        .as_ref()
        .map(CommandProcessor::from_config)
        .ok_or_else(|| ConfigError::Invalid("no processor command configured".to_string()))?;

    let sources = config.select_sources(&args.sources);
    if sources.is_empty() {
        warn!(requested = ?args.sources, "No configured sources selected; only resumed work will run");
    }
    info!(
        sources = ?sources,
        max_concurrent_sources = config.max_concurrent_sources,
        max_concurrent_articles = config.max_concurrent_articles,
        state_file = %config.state_file.display(),
        "Configuration ready"
    );

    let collaborators = Collaborators {
        factory: Arc::new(HttpClientFactory::new(
            config.user_agent.clone(),
            std::time::Duration::from_secs(30),
        )),
        discoverer: Arc::new(IndexPageDiscoverer::from_config(&config)),
        processor: Arc::new(processor),
        diagnoser: Arc::new(KeywordDiagnoser),
        priority: Arc::new(WeightedPriority::from_config(&config)),
        memory: Arc::new(ProcessMemoryProbe::new()),
    };
    let orchestrator = Arc::new(Orchestrator::new(config, sources, collaborators));
    spawn_signal_handler(Arc::clone(&orchestrator));

    let mode = if args.fresh {
        StartMode::Cold
    } else {
        StartMode::Resume
    };
    let report = orchestrator.run(mode).await?;

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        succeeded = report.progress.succeeded,
        failed = report.progress.failed,
        "Execution complete"
    );
    Ok(())
}

/// Stop the orchestrator gracefully on Ctrl-C or SIGTERM.
fn spawn_signal_handler<R: Send + Sync + 'static>(orchestrator: Arc<Orchestrator<R>>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler; Ctrl-C only");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal received; finishing in-flight work");
        orchestrator.stop();
    });
}

async fn print_status(args: StatusArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(args.config.as_deref())?;
    let report = monitor::read_progress_feed(&config.progress_file).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
