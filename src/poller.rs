//! Waiting for a remote object to reach a status.
//!
//! [`StatePoller::wait_for_state`] re-queries a status function until it
//! reports the target status, leaves the pending set, errors, or runs out
//! of time. Every sleep goes through the caller's [`Cancellation`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::cancel::Cancellation;
use crate::error::{GatewayError, PollError};

/// How the wait between polls grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait the initial interval.
    Fixed,
    /// Double the wait after each poll, up to `max`.
    Exponential {
        /// Upper bound for the wait.
        max: Duration,
    },
}

/// Parameters for one bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSpec {
    /// Status that ends the wait successfully.
    pub target: String,
    /// Statuses that mean "keep waiting".
    pub pending: Vec<String>,
    /// Total time budget, including the initial delay.
    pub timeout: Duration,
    /// Sleep before the first query.
    pub initial_delay: Duration,
    /// Floor for the wait between two queries.
    pub min_interval: Duration,
    /// Wait after the first query.
    pub interval: Duration,
    /// Growth of the wait between queries.
    pub backoff: Backoff,
    /// Treat a not-found answer as reaching the target.
    pub absent_is_target: bool,
}

impl PollSpec {
    /// Creates a spec waiting for `target` with the given pending statuses.
    ///
    /// Defaults: 10 minute timeout, no initial delay, 2 second fixed interval.
    #[must_use]
    pub fn new<I, S>(target: impl Into<String>, pending: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into(),
            pending: pending.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(600),
            initial_delay: Duration::ZERO,
            min_interval: Duration::from_secs(2),
            interval: Duration::from_secs(2),
            backoff: Backoff::Fixed,
            absent_is_target: false,
        }
    }

    /// Waits for the object to disappear, reporting `target` when it does.
    #[must_use]
    pub fn deletion<I, S>(target: impl Into<String>, pending: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            absent_is_target: true,
            ..Self::new(target, pending)
        }
    }

    /// Sets the total timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the delay before the first query.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the minimum wait between queries. Raises the interval if needed.
    #[must_use]
    pub fn with_min_interval(mut self, min: Duration) -> Self {
        self.min_interval = min;
        self.interval = self.interval.max(min);
        self
    }

    /// Sets the wait after the first query.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the backoff.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn is_pending(&self, status: &str) -> bool {
        self.pending.iter().any(|p| p == status)
    }

    fn next_interval(&self, current: Duration) -> Duration {
        match self.backoff {
            Backoff::Fixed => current,
            Backoff::Exponential { max } => current.saturating_mul(2).min(max),
        }
    }
}

/// Bounded status polling.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatePoller;

impl StatePoller {
    /// Polls `query` until it reports `spec.target`.
    ///
    /// Returns the final status. When `spec.absent_is_target` is set, a
    /// not-found answer counts as reaching the target.
    ///
    /// # Errors
    ///
    /// - [`PollError::Query`] if `query` fails with anything else.
    /// - [`PollError::UnexpectedState`] if the status is neither pending nor the target.
    /// - [`PollError::Timeout`] once the elapsed time reaches `spec.timeout`.
    /// - [`PollError::Cancelled`] if `cancel` fires.
    pub async fn wait_for_state<F, Fut>(
        spec: &PollSpec,
        cancel: &Cancellation,
        mut query: F,
    ) -> Result<String, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, GatewayError>>,
    {
        let start = Instant::now();

        if !spec.initial_delay.is_zero() {
            cancel
                .sleep(spec.initial_delay)
                .await
                .map_err(PollError::Cancelled)?;
        }

        let mut interval = spec.interval.max(spec.min_interval);
        let mut last_status: String;

        loop {
            match cancel.run(query()).await.map_err(PollError::Cancelled)? {
                Ok(status) if status == spec.target => {
                    debug!("Reached status {} after {:?}", status, start.elapsed());
                    return Ok(status);
                }
                Ok(status) if spec.is_pending(&status) => {
                    debug!("Status {} pending, waiting for {}", status, spec.target);
                    last_status = status;
                }
                Ok(status) => {
                    return Err(PollError::UnexpectedState {
                        status,
                        target: spec.target.clone(),
                    });
                }
                Err(e) if e.is_not_found() && spec.absent_is_target => {
                    debug!("Object gone, treating as {}", spec.target);
                    return Ok(spec.target.clone());
                }
                Err(e) => return Err(PollError::Query(e)),
            }

            let elapsed = start.elapsed();
            if elapsed >= spec.timeout {
                return Err(PollError::Timeout {
                    target: spec.target.clone(),
                    last_status,
                    elapsed,
                });
            }

            let remaining = spec.timeout.saturating_sub(elapsed);
            let wait = interval.min(remaining).max(spec.min_interval);
            cancel.sleep(wait).await.map_err(PollError::Cancelled)?;
            interval = spec.next_interval(interval);
        }
    }
}
