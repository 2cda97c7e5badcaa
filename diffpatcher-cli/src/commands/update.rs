//! Update command - versioned delta update.

use clap::Args;
use tracing::info;

use crate::error::CliError;
use crate::progress::ProgressDisplay;
use crate::runner::CliRunner;

use super::report_outcome;

/// Arguments for the update command.
#[derive(Debug, Clone, Default, Args)]
pub struct UpdateArgs {
    /// Install this version instead of the published latest (allows downgrades)
    #[arg(long = "version", value_name = "VERSION")]
    pub target_version: Option<String>,

    /// Maximum number of concurrent downloads and patch operations
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub concurrency: Option<u64>,

    /// Verify live files against their recorded digest before patching
    /// (off by default; overrides `verify_before_patch` in the config)
    #[arg(long, conflicts_with = "no_verify_before")]
    pub verify_before: bool,

    /// Skip the pre-patch verification when the config enables it
    #[arg(long)]
    pub no_verify_before: bool,
}

/// Run the update command.
pub async fn run(runner: &CliRunner, args: UpdateArgs) -> Result<(), CliError> {
    let mut options = runner.config().update.clone();
    if let Some(version) = args.target_version {
        options = options.with_target_version(version);
    }
    if let Some(concurrency) = args.concurrency {
        options = options.with_concurrency(concurrency as usize);
    }
    if args.verify_before {
        options = options.with_verify_before_patch(true);
    } else if args.no_verify_before {
        options = options.with_verify_before_patch(false);
    }
    info!(?options, "Running versioned update");

    let display = ProgressDisplay::new();
    let client = runner.client(Some(display.callback()))?;
    let result = client.update(&options, runner.cancel()).await;
    display.finish();

    report_outcome(&result?);
    Ok(())
}
