//! Bounded retry of remote calls that fail with a conflict.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::cancel::{CancelReason, Cancellation};
use crate::error::GatewayError;

/// Default number of attempts before a conflict is surfaced.
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 15;

/// Default delay between conflicting attempts.
pub const DEFAULT_CONFLICT_DELAY: Duration = Duration::from_secs(2);

/// How often and how far apart to repeat a call that hits a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRetry {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONFLICT_ATTEMPTS,
            delay: DEFAULT_CONFLICT_DELAY,
        }
    }
}

/// Why a conflict-retried call gave up.
#[derive(Debug)]
pub enum RetryFailure {
    /// Every attempt conflicted.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last conflict.
        last: GatewayError,
    },
    /// A non-conflict error, surfaced unchanged.
    Failed(GatewayError),
    /// The caller cancelled.
    Cancelled(CancelReason),
}

impl ConflictRetry {
    /// Creates a policy. At least one attempt is always made.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Runs `op`, repeating it after `delay` while it fails with a conflict.
    ///
    /// Returns the number of attempts on success.
    ///
    /// # Errors
    ///
    /// Returns [`RetryFailure::Exhausted`] once `max_attempts` conflicts have
    /// been seen, [`RetryFailure::Failed`] for any other error, and
    /// [`RetryFailure::Cancelled`] if `cancel` fires.
    pub async fn run<F, Fut>(&self, cancel: &Cancellation, mut op: F) -> Result<u32, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), GatewayError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match cancel.run(op()).await.map_err(RetryFailure::Cancelled)? {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_conflict() => {
                    if attempt >= max_attempts {
                        return Err(RetryFailure::Exhausted { attempts: attempt, last: e });
                    }
                    warn!(
                        "Conflict on attempt {} of {}, retrying in {:?}: {}",
                        attempt, max_attempts, self.delay, e
                    );
                    cancel
                        .sleep(self.delay)
                        .await
                        .map_err(RetryFailure::Cancelled)?;
                }
                Err(e) => return Err(RetryFailure::Failed(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn conflicting(times: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<(), GatewayError>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < times {
                std::future::ready(Err(GatewayError::conflict("firewall_policy", "p1", "in use")))
            } else {
                std::future::ready(Ok(()))
            }
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_conflicts() {
        let (calls, op) = conflicting(3);
        let start = Instant::now();
        let attempts = ConflictRetry::default()
            .run(&Cancellation::none(), op)
            .await
            .unwrap();
        assert_eq!(attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let (calls, op) = conflicting(u32::MAX);
        let result = ConflictRetry::new(5, Duration::from_secs(1))
            .run(&Cancellation::none(), op)
            .await;
        assert!(matches!(result, Err(RetryFailure::Exhausted { attempts: 5, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = ConflictRetry::default()
            .run(&Cancellation::none(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(GatewayError::remote(500, "boom")))
            })
            .await;
        assert!(matches!(result, Err(RetryFailure::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
