//! Retry policy shared by broker dispatch and binding execution.
//!
//! Uses `backon` with a zero-delay constant backoff: a transient failure is
//! re-attempted immediately, up to `max_retries` more times. Any other error
//! ends the loop on the spot.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder, Retryable};
use tracing::warn;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: usize = 2;

/// Outcome of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: usize,
}

/// Bounded retry on a designated transient error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = single attempt).
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self { max_retries }
    }

    /// Single attempt, never retried.
    pub fn none() -> Self {
        Self { max_retries: 0 }
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(Duration::ZERO)
            .with_max_times(self.max_retries)
    }

    /// Run `operation`, re-attempting while `is_transient` holds.
    pub async fn run<T, E, F, Fut, P>(&self, label: &str, operation: F, is_transient: P) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut operation = operation;
        let mut attempts = 0usize;
        let max_retries = self.max_retries;

        let result = (|| {
            attempts += 1;
            operation()
        })
        .retry(self.backoff())
        .when(|e| is_transient(e))
        .notify(|e, _| {
            warn!(
                operation = %label,
                max_retries,
                error = %e,
                "Transient failure, retrying"
            );
        })
        .await;

        Attempted { result, attempts }
    }
}

/// Backoff for adapter reconnect loops.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Jitter enabled
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter()
}
