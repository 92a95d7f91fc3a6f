//! Retry with exponential backoff around remote API calls
//!
//! Only transient failures (see [`ApiError::is_transient`]) are retried.
//! Backoff sleeps are suspension points for the shutdown coordinator.

use std::time::Duration;

use log::warn;
use rand::Rng;

use super::shutdown::{Interrupt, ShutdownCoordinator};
use crate::remote::ApiError;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::api()
    }
}

impl RetryPolicy {
    /// Gmail API calls: 5 attempts, 250ms doubling up to 16s
    #[must_use]
    pub fn api() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(16),
            factor: 2.0,
        }
    }

    /// Minimal delays, for tests and local doubles
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Upper bound of the backoff window after `attempt` failures (1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let secs = self.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before the next attempt, with full jitter in `[0, ceiling]`
    ///
    /// A server-provided `Retry-After` is honored as a lower bound.
    pub fn delay(&self, attempt: u32, jitter: f64, retry_after: Option<Duration>) -> Duration {
        let jittered = self.ceiling(attempt).mul_f64(jitter.clamp(0.0, 1.0));
        match retry_after {
            Some(min) => jittered.max(min),
            None => jittered,
        }
    }
}

/// Run `operation` until it succeeds, fails fatally, or exhausts the policy
///
/// Backoff sleeps end early when `interrupt` applies to the shutdown state;
/// the last error is then returned without further attempts.
pub fn with_retry<T, F>(
    what: &str,
    policy: &RetryPolicy,
    shutdown: &ShutdownCoordinator,
    interrupt: Interrupt,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Result<T, ApiError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= policy.max_attempts {
            return Err(err);
        }

        let delay = policy.delay(attempt, rand::thread_rng().r#gen(), err.retry_after());
        warn!(
            "{} failed (attempt {}/{}): {}; retrying in {:?}",
            what, attempt, policy.max_attempts, err, delay
        );

        if !shutdown.sleep(delay, interrupt) {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_grows_and_caps() {
        let policy = RetryPolicy::api();
        assert_eq!(policy.ceiling(1), Duration::from_millis(250));
        assert_eq!(policy.ceiling(2), Duration::from_millis(500));
        assert_eq!(policy.ceiling(3), Duration::from_secs(1));
        assert_eq!(policy.ceiling(20), Duration::from_secs(16));
    }

    #[test]
    fn test_delay_jitter_and_retry_after() {
        let policy = RetryPolicy::api();
        assert_eq!(policy.delay(2, 0.0, None), Duration::ZERO);
        assert_eq!(policy.delay(2, 1.0, None), Duration::from_millis(500));
        assert_eq!(
            policy.delay(2, 0.5, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_transient_errors_are_retried_until_success() {
        let shutdown = ShutdownCoordinator::new();
        let mut calls = 0;
        let result = with_retry("op", &RetryPolicy::fast(), &shutdown, Interrupt::OnForceStop, || {
            calls += 1;
            if calls < 3 {
                Err(ApiError::Server {
                    status: 503,
                    message: "unavailable".into(),
                })
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_attempts_are_bounded() {
        let shutdown = ShutdownCoordinator::new();
        let mut calls = 0;
        let result: Result<(), _> =
            with_retry("op", &RetryPolicy::fast(), &shutdown, Interrupt::OnForceStop, || {
                calls += 1;
                Err(ApiError::rate_limited("slow down"))
            });
        assert!(matches!(result, Err(ApiError::RateLimited { .. })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_fatal_errors_are_not_retried() {
        let shutdown = ShutdownCoordinator::new();
        let mut calls = 0;
        let result: Result<(), _> =
            with_retry("op", &RetryPolicy::fast(), &shutdown, Interrupt::OnForceStop, || {
                calls += 1;
                Err(ApiError::Auth("invalid token".into()))
            });
        assert!(matches!(result, Err(ApiError::Auth(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_shutdown_stops_retrying() {
        let shutdown = ShutdownCoordinator::new();
        shutdown.request_shutdown();
        let mut calls = 0;
        let result: Result<(), _> =
            with_retry("list", &RetryPolicy::fast(), &shutdown, Interrupt::OnShutdown, || {
                calls += 1;
                Err(ApiError::Timeout("slow".into()))
            });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
