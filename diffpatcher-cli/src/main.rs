//! diffpatcher - keep an artifact root in sync with published releases.

mod commands;
mod error;
mod progress;
mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::update::UpdateArgs;
use error::CliError;
use runner::CliRunner;

#[derive(Debug, Parser)]
#[command(name = "diffpatcher")]
#[command(version, about = "Delta-first updates from content-addressed mirrors")]
struct Cli {
    /// Configuration file (default: <config dir>/diffpatcher/config.ini)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Update to the latest (or a given) version using binary deltas
    Update(UpdateArgs),
    /// Update from the configured patch bundle, reinstalling on failure
    SimpleUpdate,
    /// Show installed and published versions
    Status,
    /// Remove the staging storage folder and its backups
    Cleanup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        e.exit();
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let runner = CliRunner::new(cli.config)?;
    match cli.command {
        Commands::Update(args) => commands::update::run(&runner, args).await,
        Commands::SimpleUpdate => commands::simple_update::run(&runner).await,
        Commands::Status => commands::status::run(&runner).await,
        Commands::Cleanup => commands::cleanup::run(&runner),
    }
}
