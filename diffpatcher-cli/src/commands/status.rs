//! Status command - show installed and published versions.

use crate::error::CliError;
use crate::progress::print_status;
use crate::runner::CliRunner;

/// Run the status command.
pub async fn run(runner: &CliRunner) -> Result<(), CliError> {
    let client = runner.client(None)?;
    let status = client.status(runner.cancel()).await?;

    println!("Root:       {}", runner.config().root.display());
    println!(
        "Installed:  {}",
        status.local_version.as_deref().unwrap_or("none")
    );
    println!("Published:  {}", status.remote_version);
    println!("Mirror:     {}", status.mirror);
    println!();

    if status.update_available {
        print_status("Available", "run `diffpatcher update` to install");
    } else {
        print_status("Up to date", "");
    }
    Ok(())
}
