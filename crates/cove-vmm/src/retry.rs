//! Exponential backoff and retry for flaky control socket calls.

use crate::error::{Result, VmError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// First wait between attempts.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Ceiling for the wait between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Doubling interval generator with a hard ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// Return the interval to wait now and advance to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, runs out
/// of retries or `cancel` fires.
///
/// Returns the number of retries consumed alongside the outcome. A
/// non-transient error on the first attempt consumes none. Once more than
/// `max_retries` transient failures pile up the last one is wrapped in
/// [`VmError::MaxRetriesExceeded`].
pub async fn retry_request<T, F, Fut>(
    cancel: &CancellationToken,
    max_retries: u32,
    mut op: F,
) -> (u32, Result<T>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::default();
    let mut retries = 0u32;

    loop {
        if cancel.is_cancelled() {
            return (retries, Err(VmError::Cancelled));
        }

        let err = match op().await {
            Ok(value) => return (retries, Ok(value)),
            Err(e) if !e.is_transient() => return (retries, Err(e)),
            Err(e) => e,
        };

        if retries >= max_retries {
            tracing::warn!(retry_times = retries, error = %err, "Retry budget exhausted");
            return (
                retries,
                Err(VmError::MaxRetriesExceeded {
                    attempts: retries + 1,
                    source: Box::new(err),
                }),
            );
        }

        retries += 1;
        let delay = backoff.next_delay();
        tracing::debug!(
            retry_times = retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient control socket error, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return (retries, Err(VmError::Cancelled)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
