//! Retry with exponential backoff for controller calls
//!
//! Connection-refused failures back off exponentially up to a cap; any other
//! failure is retried on a fixed delay. Neither is bounded by an attempt count:
//! a pipeline worker waits out controller restarts rather than giving up.
//! Only [`TransportError::Fatal`] ends the retry loop with an error.

use crate::config::RetrySection;
use crate::transport::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Smallest delay the exponential backoff grows from
const BACKOFF_FLOOR: Duration = Duration::from_millis(1);

/// Timing parameters for retries and idle polling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub backoff_base: f64,
    pub backoff_cap: Duration,
    pub steady_retry_delay: Duration,
    pub idle_delay_on_empty: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn from_config(section: &RetrySection) -> Self {
        Self {
            backoff_base: section.backoff_base,
            backoff_cap: section.backoff_cap(),
            steady_retry_delay: section.steady_retry_delay(),
            idle_delay_on_empty: section.idle_delay_on_empty(),
        }
    }

    /// Delay following `current` after another "unavailable" failure
    ///
    /// `min(max(current, 1ms) * base, cap)`, so starting from zero the Nth
    /// delay is `min(base^N ms, cap)`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        if current >= self.backoff_cap {
            return self.backoff_cap;
        }
        let nanos = current.max(BACKOFF_FLOOR).as_nanos() as f64 * self.backoff_base;
        duration_from_nanos(nanos).min(self.backoff_cap)
    }

    /// Closed form of the Nth consecutive backoff delay, `min(base^N ms, cap)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let cap_nanos = self.backoff_cap.as_nanos() as f64;
        let nanos = (self.backoff_base.powi(exponent) * 1_000_000.0).min(cap_nanos);
        duration_from_nanos(nanos)
    }
}

fn duration_from_nanos(nanos: f64) -> Duration {
    if nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Runs controller operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Copy)]
pub struct RetryingTransport {
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds or fails fatally
    ///
    /// Every attempt is preceded by a sleep of the current delay, which starts
    /// at `initial_delay`.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        initial_delay: Duration,
        mut attempt: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut delay = initial_delay;
        let mut attempts: u64 = 0;

        loop {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            attempts += 1;

            let error = match attempt().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(operation, attempts, "Controller call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            delay = match &error {
                TransportError::Fatal { .. } => return Err(error),
                TransportError::Unavailable { .. } => self.policy.next_backoff(delay),
                TransportError::Transient { .. } | TransportError::NotFound => {
                    self.policy.steady_retry_delay
                }
            };

            warn!(
                operation,
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Controller call failed, retrying"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn test_default_policy_values() {
        let policy = policy();
        assert_eq!(policy.backoff_base, 1.5);
        assert_eq!(policy.backoff_cap, Duration::from_secs(30));
        assert_eq!(policy.steady_retry_delay, Duration::from_secs(2));
        assert_eq!(policy.idle_delay_on_empty, Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_grows_from_zero() {
        let policy = policy();
        let first = policy.next_backoff(Duration::ZERO);
        let second = policy.next_backoff(first);

        assert_eq!(first, Duration::from_micros(1500));
        assert_eq!(second, Duration::from_micros(2250));
    }

    #[test]
    fn test_backoff_delay_closed_form() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(1), Duration::from_micros(1500));
        assert_eq!(policy.backoff_delay(2), Duration::from_micros(2250));
        assert_eq!(policy.backoff_delay(100), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_iterated_backoff_matches_closed_form() {
        let policy = policy();
        let mut delay = Duration::ZERO;
        for n in 1..=40 {
            delay = policy.next_backoff(delay);
            let expected = policy.backoff_delay(n);
            let diff = if delay > expected {
                delay - expected
            } else {
                expected - delay
            };
            assert!(
                diff < Duration::from_millis(1),
                "attempt {n}: {delay:?} vs {expected:?}"
            );
        }
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_holds_at_cap() {
        let policy = policy();
        assert_eq!(policy.next_backoff(Duration::from_secs(30)), Duration::from_secs(30));
        assert_eq!(policy.next_backoff(Duration::from_secs(25)), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_cap(current_ms in 0u64..120_000) {
            let policy = policy();
            let next = policy.next_backoff(Duration::from_millis(current_ms));
            prop_assert!(next <= policy.backoff_cap);
        }

        #[test]
        fn prop_backoff_is_non_decreasing(current_ms in 0u64..30_000) {
            let policy = policy();
            let current = Duration::from_millis(current_ms);
            prop_assert!(policy.next_backoff(current) >= current);
        }

        #[test]
        fn prop_closed_form_bounded(n in 0u32..10_000) {
            let policy = policy();
            prop_assert!(policy.backoff_delay(n) <= policy.backoff_cap);
        }
    }
}
