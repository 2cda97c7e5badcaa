//! CLI runner for common setup.
//!
//! Loads the configuration, initializes logging and wires Ctrl+C to the
//! cancellation scope shared by every command.

use std::path::PathBuf;

use tracing::info;

use diffpatcher::config::default_config_path;
use diffpatcher::logging::{default_log_dir, default_log_file, init_logging, LoggingGuard};
use diffpatcher::{CancelScope, ClientConfig, ProgressCallback, UpdateClient};

use crate::error::CliError;

/// Runner that manages CLI lifecycle and common operations.
pub struct CliRunner {
    /// Logging guard - keeps logging active while runner exists
    #[allow(dead_code)]
    logging_guard: LoggingGuard,
    config: ClientConfig,
    cancel: CancelScope,
}

impl CliRunner {
    /// Load the configuration at `config_path` (or the default location),
    /// initialize logging and install the Ctrl+C handler.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, CliError> {
        let path = config_path.unwrap_or_else(default_config_path);
        let config = ClientConfig::load(&path)
            .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;

        // Progress bars own the terminal; only log to stderr when redirected.
        let console = !console::Term::stderr().is_term();
        let logging_guard = init_logging(&default_log_dir(), default_log_file(), console)
            .map_err(|e| CliError::LoggingInit(e.to_string()))?;
        info!(config = %path.display(), root = %config.root.display(), "diffpatcher starting");

        let cancel = CancelScope::new();
        let handler_scope = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!();
            eprintln!("Interrupted, cancelling...");
            handler_scope.cancel("interrupted by user");
        })
        .map_err(|e| CliError::Signal(e.to_string()))?;

        Ok(Self {
            logging_guard,
            config,
            cancel,
        })
    }

    /// Loaded configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Cancellation scope tripped by Ctrl+C.
    pub fn cancel(&self) -> &CancelScope {
        &self.cancel
    }

    /// Build an update client, optionally reporting progress.
    pub fn client(&self, progress: Option<ProgressCallback>) -> Result<UpdateClient, CliError> {
        let client = UpdateClient::new(self.config.clone())?;
        Ok(match progress {
            Some(callback) => client.with_progress(callback),
            None => client,
        })
    }
}
