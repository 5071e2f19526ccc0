//! Status polling for asynchronous remote operations.
//!
//! Cloud mutations return before their side effects are visible; this
//! module waits until a describe probe reports a status from the target
//! set, fails fast on failure statuses, and bounds the whole wait with a
//! timeout and the caller's budget.
//!
//! Absence is meaningful and asymmetric: while waiting for a freshly
//! created entity a missing describe result is an error, while waiting
//! for deletion it is the success signal. Every [`PollTarget`] therefore
//! declares its absence policy explicitly at construction.
//!
//! # Example
//!
//! ```rust,ignore
//! use stratoform::poll::{OnAbsent, PollTarget};
//! use stratoform::budget::Budget;
//! use std::time::Duration;
//!
//! let target = PollTarget::new("vm-0a1b2c", OnAbsent::Fail)
//!     .target(["running"])
//!     .pending(["pending"])
//!     .failure(["error"])
//!     .timeout(Duration::from_secs(300));
//!
//! let result = target
//!     .wait(Duration::from_secs(5), &Budget::unbounded(), || async {
//!         // Describe the entity; Ok(None) means it does not exist
//!         Ok(Some("running".to_string()))
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use indexmap::IndexSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::Budget;
use crate::error::{Error, Result};

/// Policy for a probe reporting that the entity does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnAbsent {
    /// Absence completes the wait successfully (deletion waits).
    Done,
    /// Absence is a failure (creation and settle waits).
    Fail,
}

/// Outcome of a completed wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    /// Status that satisfied the wait, or `None` when absence did.
    pub status: Option<String>,
    /// Number of probes issued.
    pub probes: u32,
    /// Wall-clock time the wait took.
    pub elapsed: Duration,
}

/// Acceptance criteria for one status wait.
#[derive(Debug, Clone)]
pub struct PollTarget {
    /// Entity identifier or description, used in errors and log lines.
    pub entity: String,
    /// What a probe returning "absent" means for this wait.
    pub on_absent: OnAbsent,
    /// Statuses that complete the wait successfully.
    pub target_statuses: IndexSet<String>,
    /// Statuses expected on the way to a target status.
    pub pending_statuses: IndexSet<String>,
    /// Statuses that abort the wait as a remote failure.
    pub failure_statuses: IndexSet<String>,
    /// Maximum wall-clock time for the whole wait.
    pub timeout: Duration,
}

impl PollTarget {
    /// Creates a poll target for `entity` with the given absence policy
    /// and a 300 second timeout.
    pub fn new(entity: impl Into<String>, on_absent: OnAbsent) -> Self {
        Self {
            entity: entity.into(),
            on_absent,
            target_statuses: IndexSet::new(),
            pending_statuses: IndexSet::new(),
            failure_statuses: IndexSet::new(),
            timeout: Duration::from_secs(300),
        }
    }

    /// Sets the target status set.
    pub fn target<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the pending status set.
    pub fn pending<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pending_statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the failure status set.
    pub fn failure<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure_statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the wait timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates the status sets.
    ///
    /// The target set must not overlap the pending or failure sets, the
    /// pending and failure sets must not overlap each other, and a wait
    /// whose absence policy is [`OnAbsent::Fail`] needs at least one
    /// target status to ever complete.
    pub fn validate(&self) -> Result<()> {
        if let Some(status) = self.target_statuses.intersection(&self.pending_statuses).next() {
            return Err(Error::invalid_field(
                "pending_statuses",
                format!("status '{status}' is also a target status"),
            ));
        }
        if let Some(status) = self.target_statuses.intersection(&self.failure_statuses).next() {
            return Err(Error::invalid_field(
                "failure_statuses",
                format!("status '{status}' is also a target status"),
            ));
        }
        if let Some(status) = self.pending_statuses.intersection(&self.failure_statuses).next() {
            return Err(Error::invalid_field(
                "failure_statuses",
                format!("status '{status}' is also a pending status"),
            ));
        }
        if self.target_statuses.is_empty() && self.on_absent == OnAbsent::Fail {
            return Err(Error::invalid_field(
                "target_statuses",
                "at least one target status is required unless absence completes the wait",
            ));
        }
        Ok(())
    }

    /// Polls until the entity reaches a target status or goes absent
    /// under [`OnAbsent::Done`].
    ///
    /// The probe returns `Ok(Some(status))` for a live entity, `Ok(None)`
    /// for an absent one, or an error. Retryable probe errors are
    /// tolerated and polling continues within the timeout; terminal probe
    /// errors propagate immediately, as does a status from the failure
    /// set. On timeout the error carries the last observed status.
    pub async fn wait<P, Fut>(
        &self,
        interval: Duration,
        budget: &Budget,
        mut probe: P,
    ) -> Result<PollResult>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<String>>>,
    {
        self.validate()?;

        let start = Instant::now();
        let local = budget.child(self.timeout);
        let mut probes: u32 = 0;
        let mut last_status: Option<String> = None;

        loop {
            local.checkpoint()?;
            if local.is_expired() {
                return Err(Error::wait_timeout(
                    &self.entity,
                    start.elapsed(),
                    last_status.as_deref(),
                ));
            }

            probes += 1;
            match probe().await {
                Ok(Some(status)) => {
                    if self.target_statuses.contains(status.as_str()) {
                        info!(
                            entity = %self.entity,
                            status = %status,
                            probes,
                            "target status reached"
                        );
                        return Ok(PollResult {
                            status: Some(status),
                            probes,
                            elapsed: start.elapsed(),
                        });
                    }
                    if self.failure_statuses.contains(status.as_str()) {
                        return Err(Error::state_failed(&self.entity, status));
                    }
                    if !self.pending_statuses.is_empty()
                        && !self.pending_statuses.contains(status.as_str())
                    {
                        debug!(
                            entity = %self.entity,
                            status = %status,
                            "unexpected status, continuing to poll"
                        );
                    } else {
                        debug!(entity = %self.entity, status = %status, "still pending");
                    }
                    last_status = Some(status);
                }
                Ok(None) => match self.on_absent {
                    OnAbsent::Done => {
                        info!(entity = %self.entity, probes, "entity gone, wait complete");
                        return Ok(PollResult {
                            status: None,
                            probes,
                            elapsed: start.elapsed(),
                        });
                    }
                    OnAbsent::Fail => return Err(Error::not_found(&self.entity)),
                },
                Err(e) if e.is_retryable() => {
                    warn!(entity = %self.entity, error = %e, "probe failed, continuing to poll");
                }
                Err(e) => return Err(e),
            }

            local.sleep(interval).await?;
        }
    }
}
