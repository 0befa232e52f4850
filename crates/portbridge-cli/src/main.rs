//! Portbridge CLI - forward local TCP/UDP ports to remote endpoints.
//!
//! Loads a JSON array of mappings, starts one bridge per enabled mapping and
//! keeps relaying until interrupted.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portbridge_engine::BridgeRegistry;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portbridge - forward local ports to remote endpoints
#[derive(Parser, Debug)]
#[command(name = "portbridge")]
#[command(about = "Portbridge - forward local TCP/UDP ports to remote endpoints")]
#[command(version)]
struct Cli {
    /// Enable verbose logging (logs every relayed message)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every enabled forward from the configuration file
    #[command(long_about = r#"
Start every enabled forward from the configuration file and keep relaying
until interrupted with Ctrl-C.

EXAMPLES:
  # Start with the default config.json in the working directory
  portbridge start

  # Start with an explicit config file and verbose relay logging
  portbridge start --config /etc/portbridge/config.json --verbose

ENVIRONMENT VARIABLES:
  PORTBRIDGE_CONFIG   Configuration file path
    "#)]
    Start {
        /// Configuration file path (JSON array of mappings)
        #[arg(short, long, env = "PORTBRIDGE_CONFIG", default_value = config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn start(config_path: &Path) -> Result<()> {
    let mappings = match config::load_mappings(config_path) {
        Ok(mappings) => mappings,
        Err(e) => {
            error!("{:#}", e);
            eprintln!(
                "A configuration file is a JSON array of mappings, for example:\n{}",
                config::SAMPLE_CONFIG
            );
            std::process::exit(1);
        }
    };

    let registry = match BridgeRegistry::create_forwards(&mappings).await {
        Ok(registry) => registry,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    println!("{}", registry.status_report());
    info!("press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the interrupt signal")?;
    println!("Ctrl+C signal captured, program exiting...");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Start { config } => start(&config).await,
    }
}
