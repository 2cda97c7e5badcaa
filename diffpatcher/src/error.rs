//! Error types for the update engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for update operations.
pub type UpdateResult<T> = Result<T, UpdateError>;

/// Coarse classification of an [`UpdateError`].
///
/// Callers use this to decide whether a failure can be absorbed (transport,
/// precondition) or must abort the whole operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, timeout or HTTP status failures.
    Transport,
    /// Digest mismatch before or after patching.
    Verification,
    /// The delta engine rejected a patch.
    Apply,
    /// Local version does not match a bundle's declared origin.
    Precondition,
    /// The operation was cancelled.
    Cancellation,
    /// Local filesystem failure.
    Io,
    /// Malformed server data, configuration or archive.
    Protocol,
}

/// Errors that can occur while updating an artifact root.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A transfer failed (connection error or non-success status).
    #[error("failed to fetch {url}: {reason}")]
    Transport {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// A transfer did not complete in time.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// None of the mirror candidates produced usable throughput.
    #[error("no usable mirror among {candidates} candidates")]
    NoMirrorAvailable { candidates: usize },

    /// Content digest did not match the expected value.
    #[error("digest mismatch for {}: expected {expected}, got {actual}", path.display())]
    Verification {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Delta application failed after exhausting all attempts.
    #[error("failed to patch {} after {attempts} attempts: {reason}", path.display())]
    Apply {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    /// Installed version is not the one a bundle was built against.
    #[error("bundle expects installed version {expected}, found {actual}")]
    Precondition { expected: String, actual: String },

    /// The operation was cancelled.
    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Failed to read a file or directory.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write a file or directory.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// A manifest line could not be parsed.
    #[error("invalid manifest line {line}: {reason}")]
    ManifestParse { line: usize, reason: String },

    /// A version string could not be parsed.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Archive extraction failed.
    #[error("failed to extract {}: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The caller-supplied pre-update hook refused the update.
    #[error("pre-update hook failed: {0}")]
    Hook(String),

    /// A blocking worker task panicked or was aborted.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl UpdateError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::NoMirrorAvailable { .. } => {
                ErrorKind::Transport
            }
            Self::Verification { .. } => ErrorKind::Verification,
            Self::Apply { .. } => ErrorKind::Apply,
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::Cancelled { .. } => ErrorKind::Cancellation,
            Self::ReadFailed { .. }
            | Self::WriteFailed { .. }
            | Self::CreateDirFailed { .. }
            | Self::TaskFailed(_) => ErrorKind::Io,
            Self::ManifestParse { .. }
            | Self::InvalidVersion(_)
            | Self::Extraction { .. }
            | Self::InvalidConfig(_)
            | Self::Hook(_) => ErrorKind::Protocol,
        }
    }

    /// Returns true if this error represents cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns true if the remote side answered "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                status: Some(404),
                ..
            }
        )
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ReadFailed {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::WriteFailed {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn create_dir(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CreateDirFailed {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for UpdateError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}
