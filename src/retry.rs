//! Per-item retry policy.
//!
//! One policy covers every legacy dispatch variant: `max_attempts == 1` is a
//! plain fan-out without retries, larger values retry failed items up to that
//! many attempts in total. Waits are applied between attempts, never before
//! the first one.

use std::time::Duration;

use metrics::counter;
use rand::Rng;

use crate::response::Classification;

/// How long to wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Always wait the same amount (usually zero).
    Fixed(Duration),
    /// Wait a uniformly sampled duration in `0..=max`.
    Random { max: Duration },
}

impl WaitStrategy {
    pub fn sample(&self) -> Duration {
        match *self {
            WaitStrategy::Fixed(duration) => duration,
            WaitStrategy::Random { max } => {
                let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
                if max_ms == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
            }
        }
    }
}

/// Outcome of consulting the policy after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub wait_before: Duration,
}

impl RetryDecision {
    fn stop() -> Self {
        Self {
            retry: false,
            wait_before: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    wait: WaitStrategy,
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` sends per item (at least one).
    pub fn new(max_attempts: u32, wait: WaitStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
        }
    }

    /// Single attempt per item, no waiting.
    pub fn no_retry() -> Self {
        Self::new(1, WaitStrategy::Fixed(Duration::ZERO))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn wait(&self) -> WaitStrategy {
        self.wait
    }

    /// Decide whether to send again after `attempt` (1-based) produced
    /// `classification`.
    pub fn should_retry(&self, classification: &Classification, attempt: u32) -> RetryDecision {
        if classification.is_terminal_success() {
            return RetryDecision::stop();
        }
        if attempt >= self.max_attempts {
            counter!(
                "volley_retry_denied_total",
                "reason" => "max_attempts",
                "classification" => classification.label()
            )
            .increment(1);
            return RetryDecision::stop();
        }
        RetryDecision {
            retry: true,
            wait_before: self.wait.sample(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_RETRY,
            WaitStrategy::Fixed(Duration::ZERO),
        )
    }
}
