//! Hierarchical deadlines.
//!
//! A [`Deadline`] pairs an absolute expiry with a cancellation token. Children
//! never outlive their parent: their expiry is clamped to the parent's and
//! cancelling the parent cancels every child.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
    token: CancellationToken,
}

impl Deadline {
    /// A root deadline expiring `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
            token: CancellationToken::new(),
        }
    }

    /// A child that expires after `timeout` or when `self` does, whichever is first.
    pub fn child(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        Self {
            expires_at: own.min(self.expires_at),
            token: self.token.child_token(),
        }
    }

    /// A child sharing this deadline's expiry, so it can be cancelled on its own.
    pub fn scope(&self) -> Self {
        Self {
            expires_at: self.expires_at,
            token: self.token.child_token(),
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before expiry; zero once expired or cancelled.
    pub fn remaining(&self) -> Duration {
        if self.token.is_cancelled() {
            return Duration::ZERO;
        }
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.expires_at
    }

    /// Cancel this deadline and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves when the deadline expires or is cancelled.
    pub async fn done(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.expires_at) => {}
        }
    }

    /// Sleep for `duration`, failing early with `Timeout` if the deadline ends first.
    pub async fn sleep(&self, duration: Duration, operation: &str) -> HarnessResult<()> {
        if self.is_expired() {
            return Err(HarnessError::timeout(operation, duration));
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.done() => Err(HarnessError::timeout(operation, duration)),
        }
    }
}
