//! CLI command implementations.
//!
//! - `update` - Versioned delta update from the configured mirrors
//! - `simple_update` - Patch bundle update with full reinstall fallback
//! - `status` - Installed and published versions
//! - `cleanup` - Remove the staging storage folder

pub mod cleanup;
pub mod simple_update;
pub mod status;
pub mod update;

use diffpatcher::UpdateOutcome;

use crate::progress::{print_status, print_warning};

/// Print the result of an update to stderr.
pub(crate) fn report_outcome(outcome: &UpdateOutcome) {
    match outcome {
        UpdateOutcome::NoUpdate { local_version } => {
            let version = local_version.as_deref().unwrap_or("none");
            print_status("Up to date", &format!("version {}", version));
        }
        UpdateOutcome::Updated {
            version,
            previous_version,
            report,
            fallbacks,
            reinstalled,
        } => {
            let previous = previous_version.as_deref().unwrap_or("none");
            if *reinstalled {
                print_status("Reinstalled", &format!("{} -> {}", previous, version));
                return;
            }
            print_status(
                "Updated",
                &format!(
                    "{} -> {} ({} files changed, {} unchanged)",
                    previous,
                    version,
                    report.swapped.len(),
                    report.skipped
                ),
            );
            if *fallbacks > 0 {
                print_warning(
                    "Fallback",
                    &format!("{} files downloaded in full", fallbacks),
                );
            }
        }
    }
}
