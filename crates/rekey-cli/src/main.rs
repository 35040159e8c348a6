//! Rekey CLI (rekey)
//!
//! Derives a bucket key for every document matched by the configured
//! aggregation and writes it back to the same collection.
//!
//! ## Quick Start
//!
//! ```bash
//! # Point at the store gateway
//! export REKEY_STORE_URL=http://localhost:8080
//!
//! # Run the read phase, then the write phase
//! rekey --collection gdelt2 run
//!
//! # Check what key a given identifier maps to
//! rekey derive 64f1a2b3c4d5e6f708192a3b
//!
//! # Print the effective configuration
//! rekey --config rekey.toml show-config
//! ```
//!
//! ## Configuration
//!
//! Settings come from an optional TOML file (`--config`, or `REKEY_CONFIG`),
//! then command-line overrides. Logging honours `RUST_LOG` (default `info`).
//!
//! The process exits non-zero on any fatal error: a malformed identifier, a
//! rejected aggregation, or a failed bulk write.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "rekey")]
#[command(about = "Derive keys from hex identifiers and write them back in bulk", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "REKEY_CONFIG")]
    config: Option<PathBuf>,

    /// Store gateway URL
    #[arg(long, env = "REKEY_STORE_URL")]
    store_url: Option<String>,

    /// Database name
    #[arg(long)]
    database: Option<String>,

    /// Collection name
    #[arg(long)]
    collection: Option<String>,

    /// Maximum update operations per bulk request
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Modulus applied to each identifier
    #[arg(short, long)]
    modulus: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read every matching document, then write the derived keys
    Run,
    /// Print the key derived from each hex value
    Derive {
        /// Hex strings
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = config::Overrides {
        store_url: cli.store_url,
        database: cli.database,
        collection: cli.collection,
        batch_size: cli.batch_size,
        modulus: cli.modulus,
    };
    let pipeline_config = config::resolve(cli.config.as_deref(), &overrides)?;

    match cli.command {
        Commands::Run => commands::run(pipeline_config).await,
        Commands::Derive { values } => commands::derive(&pipeline_config, &values),
        Commands::ShowConfig => commands::show_config(&pipeline_config),
    }
}
