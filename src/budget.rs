//! Wall-clock budgets and cancellation for lifecycle steps.
//!
//! Every retry loop and status wait in the crate suspends exclusively
//! through [`Budget::sleep`], so caller cancellation and deadline expiry
//! are observed at each pause point. In-flight remote calls are never
//! aborted; the budget is consulted between them.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Time budget for one lifecycle step.
///
/// Combines the caller's [`CancellationToken`] with an optional wall-clock
/// deadline. Cloning shares the token, so cancelling the caller's token
/// stops every loop driven by clones of this budget.
#[derive(Debug, Clone)]
pub struct Budget {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Budget {
    /// Creates a budget with no deadline, driven by the given token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Creates a budget with neither a deadline nor an external token.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Creates a budget that expires `limit` from now.
    pub fn with_deadline(cancel: CancellationToken, limit: Duration) -> Self {
        Self {
            cancel,
            deadline: Some(Instant::now() + limit),
        }
    }

    /// Derives a budget sharing this token, expiring `limit` from now or
    /// at this budget's own deadline, whichever comes first.
    pub fn child(&self, limit: Duration) -> Self {
        let child_deadline = Instant::now() + limit;
        let deadline = match self.deadline {
            Some(own) => Some(own.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            cancel: self.cancel.clone(),
            deadline,
        }
    }

    /// Returns the cancellation token backing this budget.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true if the caller has cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the time left before the deadline, or `None` if unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns true if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }

    /// Fails with [`Error::Cancelled`] if the caller has cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Sleeps for `duration`, clamped to the remaining deadline.
    ///
    /// Returns early with [`Error::Cancelled`] if the token fires during
    /// the sleep. A zero remaining budget yields once and returns `Ok`;
    /// the caller's loop-top expiry check decides what the timeout means.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let clamped = match self.remaining() {
            Some(rem) => duration.min(rem),
            None => duration,
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(clamped) => Ok(()),
        }
    }
}
