//! Simple update command - patch bundle with full reinstall fallback.

use crate::error::CliError;
use crate::progress::ProgressDisplay;
use crate::runner::CliRunner;

use super::report_outcome;

/// Run the simple-update command.
pub async fn run(runner: &CliRunner) -> Result<(), CliError> {
    let bundle = &runner.config().bundle;
    if bundle.patch_mirrors.is_empty() && bundle.full_mirrors.is_empty() {
        return Err(CliError::Config(
            "no [bundle] patch_mirrors or full_mirrors configured".to_string(),
        ));
    }

    let display = ProgressDisplay::new();
    let client = runner.client(Some(display.callback()))?;
    let result = client.simple_update(None, runner.cancel()).await;
    display.finish();

    report_outcome(&result?);
    Ok(())
}
