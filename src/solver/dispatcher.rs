//! Update dispatcher.
//!
//! Pushes batches of attribute updates through an [`UpdateSink`]. Failures
//! arrive already classified by the sink; only [`FailureKind::Transient`]
//! is retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{DispatchError, FailureKind, SendFailure};
use crate::model::AttrUpdate;

/// Something that accepts attribute batches on behalf of a solver.
pub trait UpdateSink: Send + Sync {
    /// Sends one batch. The whole batch is accepted or the call fails.
    ///
    /// # Errors
    ///
    /// Returns a classified [`SendFailure`].
    fn send_data(&self, updates: &[AttrUpdate], synchronous: bool) -> Result<(), SendFailure>;

    /// Returns true while the underlying session is usable.
    fn connected(&self) -> bool;
}

impl<S: UpdateSink + ?Sized> UpdateSink for Arc<S> {
    fn send_data(&self, updates: &[AttrUpdate], synchronous: bool) -> Result<(), SendFailure> {
        (**self).send_data(updates, synchronous)
    }

    fn connected(&self) -> bool {
        (**self).connected()
    }
}

/// Retry behavior for transient send failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. `None` retries forever.
    pub max_transient_retries: Option<u64>,
    /// Pause between attempts.
    pub backoff: Duration,
    /// Stop retrying once the sink reports it is disconnected.
    pub check_connected: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_retries: None,
            backoff: Duration::ZERO,
            check_connected: true,
        }
    }
}

impl RetryPolicy {
    /// Retries transient failures at most `max` times.
    #[must_use]
    pub fn bounded(max: u64) -> Self {
        Self {
            max_transient_retries: Some(max),
            ..Self::default()
        }
    }
}

/// Sends update batches with retry on transient failure.
#[derive(Debug)]
pub struct UpdateDispatcher<S> {
    sink: S,
    policy: RetryPolicy,
    attempts: AtomicU64,
    transient_retries: AtomicU64,
}

impl<S: UpdateSink> UpdateDispatcher<S> {
    /// Creates a dispatcher with the default (unbounded) retry policy.
    pub fn new(sink: S) -> Self {
        Self::with_policy(sink, RetryPolicy::default())
    }

    /// Creates a dispatcher with an explicit retry policy.
    pub fn with_policy(sink: S, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            attempts: AtomicU64::new(0),
            transient_retries: AtomicU64::new(0),
        }
    }

    /// Pushes `updates`, retrying while the sink reports transient failure.
    ///
    /// An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Permanent` / `DispatchError::Fatal` on the first
    ///   non-transient failure, without retrying.
    /// - `DispatchError::RetryBudgetExhausted` if a retry limit is set and
    ///   reached.
    /// - `DispatchError::Disconnected` if the sink went away mid-retry and
    ///   the policy checks for it.
    pub fn send_data(&self, updates: &[AttrUpdate], synchronous: bool) -> Result<(), DispatchError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let failure = match self.sink.send_data(updates, synchronous) {
                Ok(()) => {
                    if attempts > 1 {
                        debug!(attempts, "Batch accepted after retry");
                    }
                    return Ok(());
                }
                Err(failure) => failure,
            };

            match failure.kind {
                FailureKind::Transient => {}
                FailureKind::Permanent => return Err(DispatchError::Permanent(failure)),
                FailureKind::Fatal => return Err(DispatchError::Fatal(failure)),
            }

            let retries = attempts - 1;
            if self.policy.max_transient_retries.is_some_and(|max| retries >= max) {
                return Err(DispatchError::RetryBudgetExhausted {
                    attempts,
                    last: failure,
                });
            }
            if self.policy.check_connected && !self.sink.connected() {
                return Err(DispatchError::Disconnected { attempts });
            }

            warn!(
                attempts,
                error = %failure,
                "Experiencing socket slow down with world model connection; retrying"
            );
            self.transient_retries.fetch_add(1, Ordering::Relaxed);
            if !self.policy.backoff.is_zero() {
                thread::sleep(self.policy.backoff);
            }
        }
    }

    /// Total sink calls made.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Total retries caused by transient failures.
    #[must_use]
    pub fn transient_retries(&self) -> u64 {
        self.transient_retries.load(Ordering::Relaxed)
    }

    /// The active retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The wrapped sink.
    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }
}
