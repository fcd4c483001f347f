use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod autosave;
mod config;
mod daemon;
mod lock;
mod notify;

#[derive(Parser)]
#[command(name = "atlas-backupd")]
#[command(about = "Periodic tar.xz world backups with bounded retention", long_about = None)]
struct Cli {
    /// Path to backupd.toml (defaults to the per-user data directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up on a timer until interrupted
    Run,
    /// Back up every source once and exit
    Once,
    /// Validate the config and print what would be backed up
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let (path, config) = config::load(cli.config)?;

    match cli.command {
        Commands::Run => {
            daemon::run(config).await?;
        }
        Commands::Once => {
            if !daemon::once(config).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Check => {
            daemon::check(&path, &config);
        }
    }

    Ok(ExitCode::SUCCESS)
}
