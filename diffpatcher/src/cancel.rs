//! Cooperative cancellation for update operations.
//!
//! A [`CancelScope`] is created once per top-level operation and threaded
//! through every stage. It can be cancelled exactly once with a reason; every
//! task awaiting [`CancelScope::cancelled`] wakes immediately. Child scopes
//! (used by mirror probes) are cancelled together with their parent but can be
//! cancelled on their own without affecting it.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::{UpdateError, UpdateResult};

/// Reason reported when a scope was cancelled through its parent without an
/// explicit reason of its own.
const INHERITED_REASON: &str = "parent operation cancelled";

/// Cancellation scope with a recorded reason.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
    parent: Option<Box<CancelScope>>,
}

impl CancelScope {
    /// Create a new, uncancelled root scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a child scope.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Cancel this scope.
    ///
    /// Returns `true` if this call performed the cancellation, `false` if the
    /// scope was already cancelled (the original reason is kept).
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        if self.reason.set(reason.into()).is_err() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Returns true once the scope (or one of its ancestors) is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<String> {
        if !self.is_cancelled() {
            return None;
        }
        if let Some(reason) = self.reason.get() {
            return Some(reason.clone());
        }
        self.parent
            .as_ref()
            .and_then(|p| p.reason())
            .or_else(|| Some(INHERITED_REASON.to_string()))
    }

    /// Fail with [`UpdateError::Cancelled`] if the scope is cancelled.
    pub fn check(&self) -> UpdateResult<()> {
        if self.is_cancelled() {
            return Err(self.error());
        }
        Ok(())
    }

    /// The error value describing this scope's cancellation.
    pub fn error(&self) -> UpdateError {
        UpdateError::Cancelled {
            reason: self
                .reason()
                .unwrap_or_else(|| INHERITED_REASON.to_string()),
        }
    }

    /// Wait until the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `fut` unless the scope is cancelled first.
    pub async fn guard<T, F>(&self, fut: F) -> UpdateResult<T>
    where
        F: Future<Output = UpdateResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.error()),
            result = fut => result,
        }
    }
}
