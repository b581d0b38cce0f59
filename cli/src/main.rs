//! aptindex CLI — run the coprocessor pipeline and inspect its checkpoints.
//!
//! # Commands
//! ```text
//! aptindex process [--config <path.yaml>]
//! aptindex status  [--config <path.yaml>]
//! aptindex info
//! aptindex version
//! ```
//!
//! Without `--config`, configuration is read from the environment (a `.env`
//! file in the working directory is loaded first).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use aptindex_core::{IndexerConfig, RetryConfig, SupportedChain};

mod cmd_process;
mod cmd_status;
mod logging;

#[derive(Parser)]
#[command(
    name = "aptindex",
    about = "Aptos ledger indexer with independently checkpointed coprocessors",
    long_about = "
aptindex: a single shared transaction stream fanned out to coprocessors,
each with its own checkpoint, catching up independently before joining.

ENVIRONMENT VARIABLES (used when --config is not given):
  CHAIN_ID                      0 (jestnet), 1 (mainnet), 2 (testnet), 148 (devnet)
  GENESIS_VERSION_<chain_id>    super stream genesis, e.g. 635_567_537
  DATABASE_URL                  or DB_HOST / DB_PORT / DB_USERNAME / DB_PASSWORD / DB_NAME
  API_KEY_<chain_id>            optional bearer key for the stream endpoint
  STREAM_ENDPOINT               optional, overrides the chain's default REST endpoint
  LOG_LEVEL, RUST_LOG           log filtering
",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervised indexing pipeline until the stream ends or Ctrl-C
    Process {
        /// YAML config file (default: environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print every stored checkpoint
    Status {
        /// YAML config file (default: environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show supported chains and defaults
    Info,

    /// Print version
    Version,
}

/// Load and validate the process configuration.
fn load_config(path: Option<&Path>) -> Result<IndexerConfig> {
    let config = match path {
        Some(path) => IndexerConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            // a missing .env file is fine
            let _ = dotenvy::dotenv();
            IndexerConfig::from_env().context("loading config from environment")?
        }
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Process { config } => {
            let config = load_config(config.as_deref())?;
            logging::init_tracing(&config.log);
            cmd_process::run(config).await
        }

        Commands::Status { config, json } => {
            let config = load_config(config.as_deref())?;
            logging::init_tracing(&config.log);
            cmd_status::run(&config, json).await
        }

        Commands::Info => {
            cmd_info();
            Ok(())
        }

        Commands::Version => {
            println!("aptindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn cmd_info() {
    let retry = RetryConfig::default();
    println!("aptindex v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Supported chains:");
    for chain in SupportedChain::ALL {
        let coin_flip = if aptindex_aptos::CoinFlipConfig::for_chain(chain).is_some() {
            "  [coin_flip]"
        } else {
            ""
        };
        println!(
            "  {:>3}  {:<8} {}{coin_flip}",
            chain.id(),
            chain.to_string(),
            chain.default_stream_endpoint()
        );
    }
    println!();
    println!("Defaults:");
    println!("  batch size:        100 transactions");
    println!("  poll interval:     1000 ms");
    println!(
        "  retry:             {} attempts, backoff {}ms → {}ms",
        retry.max_attempts, retry.initial_backoff_ms, retry.max_backoff_ms
    );
    println!("  storage backends:  memory:, sqlite:<path>, postgresql://…");
}
