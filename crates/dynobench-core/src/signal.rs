//! Session cancellation
//!
//! A [`CancelSignal`] is a [`CancellationToken`] that also remembers why it
//! was cancelled. Signals form a tree: cancelling a parent cancels every
//! descendant, and the first recorded cause wins.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why a session ended
#[derive(Debug, Clone)]
pub enum Cause {
    /// Normal termination
    Cancelled,
    /// Terminated by an error
    Failed(Arc<anyhow::Error>),
}

impl Cause {
    /// Whether this is a normal end
    pub fn is_normal(&self) -> bool {
        matches!(self, Cause::Cancelled)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Cancelled => f.write_str("cancelled"),
            Cause::Failed(err) => write!(f, "{:#}", err),
        }
    }
}

/// Hierarchical cancellation signal carrying a first-wins cause
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    cause: Arc<OnceLock<Cause>>,
    parent: Option<Arc<CancelSignal>>,
}

impl CancelSignal {
    /// Create a root signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a descendant signal
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Cancel normally
    pub fn cancel(&self) {
        self.fire(Cause::Cancelled);
    }

    /// Cancel with an error cause
    pub fn cancel_with(&self, err: impl Into<anyhow::Error>) {
        self.fire(Cause::Failed(Arc::new(err.into())));
    }

    fn fire(&self, cause: Cause) {
        // once fired, here or above, the recorded cause stands
        if !self.token.is_cancelled() {
            let _ = self.cause.set(cause);
        }
        self.token.cancel();
    }

    /// Whether the signal fired
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the signal to fire
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Why the signal fired, `None` while it has not
    ///
    /// A signal cancelled from above reports its nearest ancestor's cause.
    pub fn cause(&self) -> Option<Cause> {
        if !self.token.is_cancelled() {
            return None;
        }
        if let Some(cause) = self.cause.get() {
            return Some(cause.clone());
        }
        match &self.parent {
            Some(parent) => parent.cause(),
            None => Some(Cause::Cancelled),
        }
    }

    /// Underlying token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
