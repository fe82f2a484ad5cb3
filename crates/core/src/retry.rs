//! Retry-with-backoff combinator.
//!
//! One [`Backoff`] policy type drives every bounded retry in the
//! client: push-channel reconnection (exponential, 2s/4s/8s), history
//! polling on transient statuses, and artifact downloads (fixed 1s).
//! Waits are `tokio::time::sleep` suspensions, so dropping the future
//! returned by [`retry_with_backoff`] cancels any pending retry.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Tunable parameters for a bounded retry strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor by which the delay grows after each retry.
    pub multiplier: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Number of retries after the first attempt.
    pub max_retries: u32,
}

impl Backoff {
    /// Exponential policy: `initial_delay * multiplier^(n-1)` before retry `n`.
    pub fn exponential(initial_delay: Duration, multiplier: f64, max_retries: u32) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay: Duration::MAX,
            max_retries,
        }
    }

    /// Fixed policy: the same delay before every retry.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            max_retries,
        }
    }

    /// Delay to wait before the `retry`-th retry (1-based).
    ///
    /// The result is clamped to [`Backoff::max_delay`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..retry {
            delay = next_delay(delay, self);
        }
        delay.min(self.max_delay)
    }

    /// The full sequence of delays this policy produces before giving up.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_retries).map(move |retry| self.delay_for(retry))
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`Backoff::max_delay`].
pub fn next_delay(current: Duration, backoff: &Backoff) -> Duration {
    let next_ms = (current.as_millis() as f64 * backoff.multiplier) as u64;
    Duration::from_millis(next_ms).min(backoff.max_delay)
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// retry budget in `backoff` is spent.
///
/// `op` receives the 1-based attempt number. `is_transient` decides
/// whether an error may be retried; the last error is returned once the
/// budget is exhausted, so at most `max_retries + 1` attempts are made.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    backoff: &Backoff,
    mut is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt <= backoff.max_retries && is_transient(&e) => {
                let delay = backoff.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying",
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn next_delay_doubles() {
        let backoff = Backoff::exponential(Duration::from_secs(1), 2.0, 3);
        assert_eq!(
            next_delay(Duration::from_secs(1), &backoff),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let backoff = Backoff {
            max_delay: Duration::from_secs(10),
            ..Backoff::exponential(Duration::from_secs(1), 2.0, 5)
        };
        assert_eq!(
            next_delay(Duration::from_secs(8), &backoff),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn reconnect_sequence_is_two_four_eight() {
        let backoff = Backoff::exponential(Duration::from_secs(2), 2.0, 3);
        let delays: Vec<u64> = backoff.delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[test]
    fn fixed_policy_never_grows() {
        let backoff = Backoff::fixed(Duration::from_secs(1), 4);
        assert!(backoff.delays().all(|d| d == Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_transient_failures() {
        let backoff = Backoff::fixed(Duration::from_secs(1), 2);
        let statuses = [404u16, 404, 200];
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = retry_with_backoff(
            &backoff,
            |status: &u16| matches!(status, 404 | 500),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                let status = statuses[(attempt - 1) as usize];
                async move {
                    if status == 200 {
                        Ok(status)
                    } else {
                        Err(status)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(200));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Exactly two delayed retries of one second each.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget_is_spent() {
        let backoff = Backoff::fixed(Duration::from_secs(1), 2);
        let calls = AtomicU32::new(0);

        let result: Result<(), u16> = retry_with_backoff(
            &backoff,
            |status: &u16| matches!(status, 404 | 500),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(404) }
            },
        )
        .await;

        assert_eq!(result, Err(404));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_is_not_retried() {
        let backoff = Backoff::fixed(Duration::from_secs(1), 2);
        let calls = AtomicU32::new(0);

        let result: Result<(), u16> = retry_with_backoff(
            &backoff,
            |status: &u16| matches!(status, 404 | 500),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(403) }
            },
        )
        .await;

        assert_eq!(result, Err(403));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
