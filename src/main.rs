//! Ourgraph main entry point
//!
//! Command-line interface for the ourgraph harvester.

use anyhow::Context;
use clap::Parser;
use ourgraph::config::{load_config_with_hash, validate, Config};
use ourgraph::pipeline::filter_scrapers;
use ourgraph::scrapers::build_scrapers;
use ourgraph::store::{DgraphStore, GraphStore, MemoryStore, SCHEMA};
use ourgraph::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Ourgraph: harvests "user likes document" graphs from fan fiction and
/// book sites into Dgraph
#[derive(Parser, Debug)]
#[command(name = "ourgraph")]
#[command(version = "1.0.0")]
#[command(about = "Harvests user likes document graphs", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults apply when omitted)
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Scrape only domains containing this substring
    #[arg(long, value_name = "FILTER")]
    scrape_filter: Option<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Run the pipeline against an in-memory store instead of Dgraph
    #[arg(long, conflicts_with_all = ["apply_schema", "show_schema"])]
    dry_run: bool,

    /// Install the predicate schema and exit
    #[arg(long, conflicts_with = "show_schema")]
    apply_schema: bool,

    /// Print the schema installed in the store and exit
    #[arg(long)]
    show_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let (config, hash) = load_config_with_hash(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            config
        }
        None => {
            tracing::info!("No configuration file given, using defaults");
            Config::default()
        }
    };
    if let Some(filter) = cli.scrape_filter {
        config.pipeline.scrape_filter = filter;
    }
    validate(&config)?;

    if cli.apply_schema {
        return handle_apply_schema(&config).await;
    }
    if cli.show_schema {
        return handle_show_schema(&config).await;
    }

    let store: Arc<dyn GraphStore> = if cli.dry_run {
        tracing::info!("Dry run: uploading into an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        tracing::info!("Connecting to store at {}", config.store.address);
        Arc::new(DgraphStore::new(&config.store)?)
    };

    handle_run(config, store).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("ourgraph=info,warn"),
            1 => EnvFilter::new("ourgraph=debug,info"),
            2 => EnvFilter::new("ourgraph=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

async fn handle_apply_schema(config: &Config) -> anyhow::Result<()> {
    let store = DgraphStore::new(&config.store)?;
    store.alter(SCHEMA).await.context("failed to apply schema")?;
    println!("✓ Schema applied to {}", config.store.address);
    Ok(())
}

async fn handle_show_schema(config: &Config) -> anyhow::Result<()> {
    let store = DgraphStore::new(&config.store)?;
    let schema = store.schema().await.context("failed to query schema")?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Runs every matching scraper until interrupted or a scraper fails
async fn handle_run(config: Config, store: Arc<dyn GraphStore>) -> anyhow::Result<()> {
    let scrapers = filter_scrapers(build_scrapers(&config)?, &config.pipeline.scrape_filter);
    if scrapers.is_empty() {
        anyhow::bail!(
            "no scrapers match filter {:?}",
            config.pipeline.scrape_filter
        );
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            interrupt.cancel();
        }
    });

    tracing::info!(
        "Starting {} scrapers with {} uploaders",
        scrapers.len(),
        config.pipeline.uploaders
    );

    let orchestrator = Orchestrator::new(store, &config);
    match orchestrator.run(scrapers, &cancel).await {
        Ok(()) => {
            tracing::info!("Pipeline stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Pipeline failed: {}", e);
            Err(e.into())
        }
    }
}
