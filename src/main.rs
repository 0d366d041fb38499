//! testlens CLI - test-run telemetry and remote test ordering.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testlens::config::{self, Config};
use testlens::delivery::DeliveryCounter;
use testlens::event::Event;
use testlens::ordering::{OrchestrationHandler, RunMetadata};
use testlens::session::Session;
use testlens::uploader::{EventUploader, UploadOutcome};

#[derive(Parser)]
#[command(name = "testlens")]
#[command(about = "Test-run telemetry and remote test ordering", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testlens.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the ordering service for a test file order and print it
    Reorder {
        /// Test files in their current order
        #[arg(required = true)]
        files: Vec<String>,

        /// Also print instrumentation as JSON
        #[arg(long)]
        instrumentation: bool,
    },

    /// Upload newline-delimited JSON events to the collector
    Upload {
        /// File with one JSON event per line
        events: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Reorder {
            files,
            instrumentation,
        } => reorder(&cli.config, files, instrumentation).await,
        Commands::Upload { events } => upload(&cli.config, &events).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

/// Loads the config file, or defaults when it doesn't exist.
fn load_or_default(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        info!("No config at {}, using defaults", config_path.display());
        return Ok(Config::default());
    }

    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

async fn reorder(config_path: &Path, files: Vec<String>, show_instrumentation: bool) -> Result<()> {
    let config = load_or_default(config_path)?;
    let session = Arc::new(Session::from_env());
    let metadata = RunMetadata::from_env(&config.orchestration);

    let handler = OrchestrationHandler::from_config(&config.orchestration, session, metadata)
        .context("Failed to create ordering client")?;

    // Ctrl-C abandons polling and keeps the original order
    let cancel = handler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling test ordering");
            cancel.cancel();
        }
    });

    let ordered = handler.reorder(&files).await.unwrap_or(files);
    for file in &ordered {
        println!("{}", file);
    }

    if show_instrumentation {
        let data = serde_json::to_string_pretty(&handler.instrumentation())
            .context("Failed to encode instrumentation")?;
        println!("{}", data);
    }

    Ok(())
}

async fn upload(config_path: &Path, events_path: &Path) -> Result<()> {
    let config = load_or_default(config_path)?;
    let content = std::fs::read_to_string(events_path)
        .with_context(|| format!("Failed to read events from {}", events_path.display()))?;

    let session = Arc::new(Session::from_env());
    let counter = Arc::new(DeliveryCounter::new());
    let uploader = EventUploader::from_config(&config.collector, session, counter)
        .context("Failed to create collector client")?;

    let mut accepted = 0usize;
    let mut dropped = 0usize;
    let mut failed = 0usize;

    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line).with_context(|| {
            format!("Invalid event on line {} of {}", line_no + 1, events_path.display())
        })?;

        match uploader.upload(event).await {
            Ok(UploadOutcome::Dropped) => dropped += 1,
            Ok(_) => accepted += 1,
            Err(e) => {
                warn!("Event on line {} failed: {}", line_no + 1, e);
                failed += 1;
            }
        }
    }

    let settled = uploader.shutdown(config.collector.shutdown_timeout()).await;

    println!();
    println!("Upload summary:");
    println!("  Accepted: {}", console::style(accepted).green());
    println!("  Dropped:  {}", console::style(dropped).yellow());
    println!("  Failed:   {}", console::style(failed).red());
    if !settled {
        println!(
            "  Pending:  {}",
            console::style(uploader.pending()).red().bold()
        );
        anyhow::bail!("Timed out waiting for telemetry delivery");
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Collector:");
            println!("  URL: {}", config.collector.base_url);
            println!("  Batch size: {}", config.collector.batch_size);
            println!("  Flush interval: {}ms", config.collector.flush_interval_ms);
            println!();
            println!("Orchestration:");
            println!("  Enabled: {}", config.orchestration.enabled);
            println!("  URL: {}", config.orchestration.base_url);
            println!("  Endpoint: {}", config.orchestration.split_tests_path());

            let strategy = testlens::Strategy::resolve(&config.orchestration.strategy);
            println!("  Strategy: {}", strategy);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let config = r#"# testlens configuration file

[collector]
base_url = "https://collector.testlens.dev"
batch_size = 1000
flush_interval_ms = 2000
request_timeout_secs = 30
shutdown_timeout_secs = 60

[orchestration]
enabled = false
base_url = "https://orchestrator.testlens.dev"
prefix = "testorchestration/api/v1"
# relevant-first, failing-first, smart-selection or none
strategy = "relevant-first"
# project_name = "my-project"
# build_name = "nightly"
"#;

    let path = PathBuf::from("testlens.toml");
    if path.exists() {
        eprintln!("testlens.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created testlens.toml");
    println!();
    println!("Set TESTLENS_JWT and TESTLENS_ORCHESTRATION_TOKEN, then run:");
    println!("  testlens reorder <FILES>...");

    Ok(())
}
