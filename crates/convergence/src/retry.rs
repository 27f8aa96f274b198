//! Retry logic with fixed or exponential backoff for transient step errors.

use crate::context::Clock;
use crate::error::StepError;
use std::time::Duration;

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay multiplied by `factor` after each attempt, capped at `max_delay`
    Exponential { factor: f64, max_delay: Duration },
}

/// How often and how patiently a step is retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub delay: Duration,
    /// Delay growth
    pub backoff: Backoff,
    /// Overall deadline measured from the first attempt
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            backoff: Backoff::Fixed,
            timeout: None,
        }
    }

    /// `max_attempts` attempts with a constant delay between them.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
            timeout: None,
        }
    }

    /// `max_attempts` attempts with exponentially growing delay.
    pub fn exponential(
        max_attempts: u32,
        base_delay: Duration,
        factor: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: base_delay,
            backoff: Backoff::Exponential { factor, max_delay },
            timeout: None,
        }
    }

    /// Stop retrying once the next attempt would start after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Calculate the delay after a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max_delay } => {
                let delay = self.delay.as_secs_f64() * factor.powi(attempt as i32);
                let capped = delay.min(max_delay.as_secs_f64());
                Duration::try_from_secs_f64(capped).unwrap_or(max_delay)
            }
        }
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, StepError>,
    /// Number of times the operation ran
    pub attempts: u32,
    /// Whether the final error came from running out of attempts or time
    pub exhausted: bool,
}

/// Execute an operation with retry logic.
///
/// Retries the operation while it returns a retryable error, sleeping on
/// `clock` between attempts. Non-retryable errors return immediately.
///
/// # Arguments
/// * `policy` - Attempt count, delay and deadline
/// * `clock` - Time source for delays and the deadline
/// * `on_retry` - Called with (attempt, max_attempts, error, delay) before each sleep
/// * `operation` - The operation to execute
pub fn with_retry<T, F>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    on_retry: &mut dyn FnMut(u32, u32, &StepError, Duration),
    mut operation: F,
) -> Attempted<T>
where
    F: FnMut() -> Result<T, StepError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let started = clock.now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation() {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                    exhausted: false,
                };
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Attempted {
                result: Err(error),
                attempts: attempt,
                exhausted: false,
            };
        }

        if attempt >= max_attempts {
            return Attempted {
                result: Err(error),
                attempts: attempt,
                exhausted: true,
            };
        }

        let delay = policy.delay_for_attempt(attempt - 1);

        if let Some(timeout) = policy.timeout
            && clock.now().duration_since(started) + delay > timeout
        {
            log::debug!(
                "Deadline of {}s reached after {} attempts",
                timeout.as_secs(),
                attempt
            );
            return Attempted {
                result: Err(error),
                attempts: attempt,
                exhausted: true,
            };
        }

        on_retry(attempt, max_attempts, &error, delay);
        clock.sleep(delay);
    }
}
