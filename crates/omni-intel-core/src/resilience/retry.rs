//! Retry policy with exponential back-off and jitter (specification §4.5).

use rand::Rng;
use std::time::Duration;

use crate::config::HttpClientConfig;

/// Classification of whether a failed attempt should be retried (§4.5,
/// §7 "Transient downstream").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Retry with back-off.
    Retryable,
    /// Do not retry; surface the failure immediately.
    Fatal,
}

/// Classify an HTTP-shaped outcome for retry purposes (§4.5): network
/// errors, 503, 429 (honouring `Retry-After`), and read timeouts are
/// retried; 4xx (400/401/403/404/422, and 4xx generally) is not.
#[must_use]
pub fn classify_http_status(status: u16) -> Retryability {
    match status {
        503 | 429 => Retryability::Retryable,
        400..=499 => Retryability::Fatal,
        500..=599 => Retryability::Retryable,
        _ => Retryability::Fatal,
    }
}

/// An exponential back-off schedule with jitter, configurable attempts and
/// delay bounds (§4.5 default delays 1s, 2s, 4s, cap 10s).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn from_config(config: &HttpClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Build a policy directly from bounds, for adapters outside the HTTP
    /// client (e.g. the embedding batch producer, §4.9).
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay }
    }

    /// Maximum number of attempts (including the first).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The back-off delay before the given 1-indexed retry attempt,
    /// doubling each time and capped at `max_delay`, with up to ±20%
    /// jitter to avoid thundering-herd retries.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let unjittered = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        jitter(unjittered)
    }

    /// Run `operation` up to `max_attempts` times, retrying only when the
    /// classifier says the error is retryable. Returns the last error if
    /// every attempt fails.
    ///
    /// # Errors
    /// Returns the final attempt's error if all attempts are exhausted, or
    /// the first non-retryable error encountered.
    pub async fn run<F, Fut, T, E>(
        &self,
        mut operation: F,
        classify: impl Fn(&E) -> Retryability,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = classify(&err) == Retryability::Retryable;
                    if !retryable || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(attempt, ?delay, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let millis = base.as_millis().min(u128::from(u64::MAX)) as u64;
    if millis == 0 {
        return base;
    }
    let spread = (millis / 5).max(1); // +/-20%
    let offset = rand::thread_rng().gen_range(0..=spread * 2) as i64 - spread as i64;
    let jittered = (millis as i64 + offset).max(0) as u64;
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn status_classification_matches_spec() {
        assert_eq!(classify_http_status(503), Retryability::Retryable);
        assert_eq!(classify_http_status(429), Retryability::Retryable);
        assert_eq!(classify_http_status(500), Retryability::Retryable);
        assert_eq!(classify_http_status(400), Retryability::Fatal);
        assert_eq!(classify_http_status(401), Retryability::Fatal);
        assert_eq!(classify_http_status(403), Retryability::Fatal);
        assert_eq!(classify_http_status(404), Retryability::Fatal);
        assert_eq!(classify_http_status(422), Retryability::Fatal);
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_millis(10_000));
        // Jitter is +/-20%; check the unjittered midpoint bounds loosely.
        let d1 = policy.delay_for_attempt(1).as_millis();
        let d4 = policy.delay_for_attempt(4).as_millis();
        assert!((800..=1200).contains(&d1));
        assert!(d4 <= 10_000 + 2_000);
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<&str, &str> = policy
            .run(
                move |_attempt| {
                    let attempts = attempts_clone.clone();
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err("transient")
                        } else {
                            Ok("done")
                        }
                    }
                },
                |_| Retryability::Retryable,
            )
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_does_not_retry_fatal_errors() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<&str, &str> = policy
            .run(
                move |_attempt| {
                    let attempts = attempts_clone.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err("bad request")
                    }
                },
                |_| Retryability::Fatal,
            )
            .await;
        assert_eq!(result, Err("bad request"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
