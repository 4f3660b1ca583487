//! tradegate controller entry point.
//!
//! `tradegate run` starts the controller; the other subcommands are
//! one-shot admin operations against the same store.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use tradegate_bot::{AppConfig, Application};
use tradegate_core::AccountId;

/// Trade admission and execution controller
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via TRADEGATE_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the controller until ctrl-c (default)
    Run,
    /// Print the circuit breaker state of an account
    BreakerStatus { account: String },
    /// Clear a tripped breaker regardless of cooldown
    BreakerReset { account: String },
    /// Trip the breaker until it is reset manually
    BreakerTrip { account: String },
    /// Cancel a pending command
    Cancel { account: String, token: String },
    /// Load signals from a JSON Lines file
    ImportSignals { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tradegate_telemetry::init_logging()?;

    info!("Starting tradegate v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > TRADEGATE_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("TRADEGATE_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = AppConfig::from_file(&config_path)?;
    info!(
        store = %config.store.url,
        accounts = config.accounts.len(),
        "Configuration loaded"
    );

    let app = Application::new(config).await?;

    match args.command.unwrap_or(Cmd::Run) {
        Cmd::Run => app.run(CancellationToken::new()).await?,
        Cmd::BreakerStatus { account } => {
            let state = app.breaker_status(&AccountId::new(account)).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Cmd::BreakerReset { account } => {
            let state = app.breaker_reset(&AccountId::new(account)).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Cmd::BreakerTrip { account } => {
            let state = app.breaker_trip(&AccountId::new(account)).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Cmd::Cancel { account, token } => {
            let cancelled = app.cancel(&AccountId::new(account), &token).await?;
            println!("{}", if cancelled { "cancelled" } else { "not pending" });
        }
        Cmd::ImportSignals { path } => {
            let count = app.import_signals(&path).await?;
            println!("imported {count} signals");
        }
    }

    Ok(())
}
