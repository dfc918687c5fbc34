//! Cooperative cancellation for long-running lifecycle operations.
//!
//! A [`Cancellation`] is threaded through every gateway call and every sleep
//! the engine performs. It fires either when its [`CancelHandle`] is
//! triggered or when its optional deadline passes. [`Cancellation::none`]
//! never fires, which keeps the run-to-completion behaviour.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why an operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller triggered the cancel handle.
    Requested,
    /// The caller-level deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "cancellation requested"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Triggers the [`Cancellation`] values created alongside it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signals cancellation to every linked [`Cancellation`].
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once [`Self::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Cancellation signal and optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    signal: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// A cancellation that never fires.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            signal: None,
            deadline: None,
        }
    }

    /// Creates a linked handle and cancellation pair.
    #[must_use]
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx: Arc::new(tx) },
            Self {
                signal: Some(rx),
                deadline: None,
            },
        )
    }

    /// Adds an absolute deadline. An earlier existing deadline is kept.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Adds a deadline relative to now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason if the cancellation has already fired.
    #[must_use]
    pub fn check(&self) -> Option<CancelReason> {
        if self.signal.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Some(CancelReason::Requested);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(CancelReason::DeadlineExceeded);
        }
        None
    }

    /// Returns true if the cancellation has already fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.check().is_some()
    }

    /// Resolves when the cancellation fires. Pends forever for [`Self::none`].
    pub async fn cancelled(&self) -> CancelReason {
        let mut signal = self.signal.clone();
        let requested = async move {
            let Some(rx) = signal.as_mut() else {
                return std::future::pending::<()>().await;
            };
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Handle dropped without cancelling.
                    return std::future::pending::<()>().await;
                }
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = requested => CancelReason::Requested,
            () = expired => CancelReason::DeadlineExceeded,
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// # Errors
    ///
    /// Returns the cancel reason if the cancellation fired before the sleep ended.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Drives `fut` to completion unless cancelled first.
    ///
    /// # Errors
    ///
    /// Returns the cancel reason if the cancellation fired first. The future is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        if let Some(reason) = self.check() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(reason),
            out = fut => Ok(out),
        }
    }
}
