//! Cleanup command - remove the staging storage folder.

use crate::error::CliError;
use crate::progress::print_status;
use crate::runner::CliRunner;

/// Run the cleanup command.
pub fn run(runner: &CliRunner) -> Result<(), CliError> {
    let client = runner.client(None)?;
    client.cleanup()?;
    print_status(
        "Removed",
        &runner.config().storage.display().to_string(),
    );
    Ok(())
}
