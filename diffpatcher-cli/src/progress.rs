//! Cargo-style progress output.
//!
//! ```text
//!     [1/6] Reading local version
//!     [5/6] Downloading patches [=========>        ] 3.20 MiB/5.00 MiB
//!   Updated 1.0.0 -> 1.1.0 (12 files, 2 full downloads)
//! ```

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use diffpatcher::{ProgressCallback, ProgressEvent, Stage};
use indicatif::{ProgressBar, ProgressStyle};

/// Print a cargo-style status line to stderr.
pub fn print_status(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().green().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

/// Print a cargo-style warning line to stderr.
pub fn print_warning(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().yellow().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

/// Renders engine progress snapshots with an indicatif bar.
pub struct ProgressDisplay {
    bar: ProgressBar,
    stage: Mutex<Option<Stage>>,
}

impl ProgressDisplay {
    /// Create a display drawing to stderr.
    pub fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(bar_style());
        bar.enable_steady_tick(Duration::from_millis(100));
        Arc::new(Self {
            bar,
            stage: Mutex::new(None),
        })
    }

    /// Callback forwarding engine events to this display.
    pub fn callback(self: &Arc<Self>) -> ProgressCallback {
        let this = Arc::clone(self);
        Arc::new(move |event: &ProgressEvent| this.render(event))
    }

    /// Remove the bar from the terminal.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn render(&self, event: &ProgressEvent) {
        let entered = match self.stage.lock() {
            Ok(mut stage) if *stage != Some(event.stage) => {
                *stage = Some(event.stage);
                true
            }
            _ => false,
        };

        let step = format!("[{}/{}]", event.step_index, event.total_steps);
        if entered {
            self.bar
                .println(format!("{:>12} {}", step, event.stage.name()));
            self.bar.set_prefix(step);
            self.bar.set_message(event.stage.name());
            self.bar.set_length(0);
            self.bar.set_position(0);
        }

        if !event.transfers.is_empty() {
            let total: u64 = event.transfers.iter().filter_map(|t| t.total).sum();
            self.bar.set_length(total.max(event.transferred_bytes()));
            self.bar.set_position(event.transferred_bytes());
            if let [single] = event.transfers.as_slice() {
                self.bar
                    .set_message(format!("{} {}", event.stage.name(), single.name));
            } else {
                self.bar.set_message(format!(
                    "{} ({} files)",
                    event.stage.name(),
                    event.transfers.len()
                ));
            }
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:>10} [{bar:25.cyan/dim}] {bytes}/{total_bytes} {msg:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}
