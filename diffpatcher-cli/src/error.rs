//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and exit codes: 1 for failures, 130 when the user interrupted the
//! operation.

use std::fmt;
use std::process;

use diffpatcher::{ErrorKind, UpdateError};

/// Exit code used when the operation was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration error
    Config(String),
    /// Failed to install the Ctrl+C handler
    Signal(String),
    /// The update engine failed
    Update(UpdateError),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Update(e) if e.is_cancelled() => EXIT_CANCELLED,
            _ => 1,
        }
    }

    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::Update(e) = self {
            match e.kind() {
                ErrorKind::Transport => {
                    eprintln!();
                    eprintln!("Check that the mirrors in the configuration are reachable.");
                }
                ErrorKind::Verification | ErrorKind::Apply => {
                    eprintln!();
                    eprintln!("No files were changed. Run `diffpatcher cleanup` and retry.");
                }
                _ => {}
            }
        }

        process::exit(self.exit_code())
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Signal(msg) => write!(f, "Failed to set signal handler: {}", msg),
            CliError::Update(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Update(e) => Some(e),
            _ => None,
        }
    }
}

impl From<UpdateError> for CliError {
    fn from(e: UpdateError) -> Self {
        CliError::Update(e)
    }
}
