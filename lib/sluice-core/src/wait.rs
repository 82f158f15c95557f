//! Timeout-bounded polling.
//!
//! Every wait in a run goes through [`poll_until`], which suspends on the tokio timer between attempts. Dropping the
//! returned future cancels the wait, and paused test time drives it without real sleeping.

use std::{future::Future, time::Duration};

use tokio::time::{sleep_until, Instant};

/// A poll that did not succeed before its deadline.
#[derive(Debug)]
pub struct TimedOut<E> {
    /// How long polling went on for.
    pub elapsed: Duration,

    /// Number of attempts made.
    pub attempts: usize,

    /// The error returned by the final attempt.
    pub last: E,
}

/// Calls `attempt` until it succeeds or `timeout` elapses.
///
/// The first attempt is made immediately, and subsequent attempts are spaced `interval` apart. A final attempt is always
/// made at the deadline, so a condition that becomes true exactly at the deadline is still observed.
pub async fn poll_until<T, E, F, Fut>(interval: Duration, timeout: Duration, mut attempt: F) -> Result<T, TimedOut<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let last = match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(TimedOut {
                elapsed: now - started,
                attempts,
                last,
            });
        }

        sleep_until((now + interval).min(deadline)).await;
    }
}
