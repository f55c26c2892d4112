//! Retry policy and backoff calculation.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Hard cap on configured retries.
pub const MAX_RETRIES_LIMIT: u32 = 10;
/// Smallest accepted base delay (1 second).
pub const MIN_RETRY_DELAY_MS: i64 = 1_000;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay.
    Fixed,
    /// `base * 2^attempt`.
    Exponential,
    /// `base * (attempt + 1)`.
    Linear,
    /// `base * fib(attempt + 1)` with fib(1) = fib(2) = 1.
    Fibonacci,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry configuration carried by every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first failure (0 = none).
    pub max_retries: u32,
    /// Base delay between retries.
    pub base_delay_ms: i64,
    /// Cap applied to the computed delay before jitter.
    pub max_delay_ms: i64,
    pub strategy: BackoffStrategy,
    /// Randomize the delay to avoid thundering herds.
    pub jitter: bool,
    /// Uniform jitter range: the delay is scaled by `[1 - f, 1 + f]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 3_600_000,
            strategy: BackoffStrategy::default(),
            jitter: true,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Fixed delays without jitter, mostly useful in tests.
    pub fn fixed(max_retries: u32, delay_ms: i64) -> Self {
        Self {
            max_retries,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            strategy: BackoffStrategy::Fixed,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(DomainError::validation(format!(
                "max_retries must be at most {MAX_RETRIES_LIMIT}, got {}",
                self.max_retries
            )));
        }
        if self.base_delay_ms < MIN_RETRY_DELAY_MS {
            return Err(DomainError::validation(format!(
                "base retry delay must be at least {MIN_RETRY_DELAY_MS} ms, got {}",
                self.base_delay_ms
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(DomainError::validation(
                "max retry delay must not be smaller than the base delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DomainError::validation(format!(
                "jitter factor must be in [0, 1], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `retry_count` retries.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay in milliseconds before retry attempt `attempt` (0-indexed).
    ///
    /// The strategy value is clamped to `max_delay_ms`, then jitter scales
    /// it by a uniform factor in `[1 - jitter_factor, 1 + jitter_factor]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> i64 {
        let base = self.base_delay_ms as f64;
        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => base * 2_f64.powi(attempt.min(62) as i32),
            BackoffStrategy::Linear => base * (attempt as f64 + 1.0),
            BackoffStrategy::Fibonacci => base * fib(attempt as u64 + 1) as f64,
        };
        let clamped = raw.min(self.max_delay_ms as f64);

        let jittered = if self.jitter && self.jitter_factor > 0.0 {
            let factor = rand::thread_rng()
                .gen_range(1.0 - self.jitter_factor..=1.0 + self.jitter_factor);
            clamped * factor
        } else {
            clamped
        };

        jittered.max(0.0).round() as i64
    }
}

/// fib(1) = fib(2) = 1, saturating on overflow.
fn fib(n: u64) -> u64 {
    let (mut a, mut b) = (0_u64, 1_u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(strategy: BackoffStrategy, base: i64, max: i64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay_ms: base,
            max_delay_ms: max,
            strategy,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn exponential_doubles_per_attempt() {
        let p = policy(BackoffStrategy::Exponential, 1_000, 3_600_000);
        assert_eq!(p.delay_for_attempt(0), 1_000);
        assert_eq!(p.delay_for_attempt(1), 2_000);
        assert_eq!(p.delay_for_attempt(2), 4_000);
        assert_eq!(p.delay_for_attempt(3), 8_000);
    }

    #[test]
    fn fixed_is_constant() {
        let p = policy(BackoffStrategy::Fixed, 2_500, 3_600_000);
        for attempt in 0..5 {
            assert_eq!(p.delay_for_attempt(attempt), 2_500);
        }
    }

    #[test]
    fn linear_grows_by_base() {
        let p = policy(BackoffStrategy::Linear, 1_000, 3_600_000);
        assert_eq!(p.delay_for_attempt(0), 1_000);
        assert_eq!(p.delay_for_attempt(1), 2_000);
        assert_eq!(p.delay_for_attempt(2), 3_000);
    }

    #[test]
    fn fibonacci_follows_the_sequence() {
        let p = policy(BackoffStrategy::Fibonacci, 1_000, 3_600_000);
        // fib(1..)=1,1,2,3,5,8
        assert_eq!(p.delay_for_attempt(0), 1_000);
        assert_eq!(p.delay_for_attempt(1), 1_000);
        assert_eq!(p.delay_for_attempt(2), 2_000);
        assert_eq!(p.delay_for_attempt(3), 3_000);
        assert_eq!(p.delay_for_attempt(4), 5_000);
        assert_eq!(p.delay_for_attempt(5), 8_000);
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let p = policy(BackoffStrategy::Exponential, 1_000, 5_000);
        assert_eq!(p.delay_for_attempt(10), 5_000);
    }

    #[test]
    fn allows_retry_respects_max() {
        let p = RetryPolicy {
            max_retries: 2,
            ..Default::default()
        };
        assert!(p.allows_retry(0));
        assert!(p.allows_retry(1));
        assert!(!p.allows_retry(2));
    }

    #[test]
    fn validation_rejects_out_of_range_fields() {
        let mut p = RetryPolicy::default();
        p.max_retries = 11;
        assert!(p.validate().is_err());

        let mut p = RetryPolicy::default();
        p.base_delay_ms = 10;
        assert!(p.validate().is_err());

        let mut p = RetryPolicy::default();
        p.max_delay_ms = p.base_delay_ms - 1;
        assert!(p.validate().is_err());

        assert!(RetryPolicy::default().validate().is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn delay_never_negative_and_bounded(
            attempt in 0u32..64,
            base in 1_000i64..120_000,
            factor in 0.0f64..=1.0,
            strategy in prop_oneof![
                Just(BackoffStrategy::Fixed),
                Just(BackoffStrategy::Exponential),
                Just(BackoffStrategy::Linear),
                Just(BackoffStrategy::Fibonacci),
            ],
        ) {
            let p = RetryPolicy {
                max_retries: 5,
                base_delay_ms: base,
                max_delay_ms: 3_600_000,
                strategy,
                jitter: true,
                jitter_factor: factor,
            };
            let delay = p.delay_for_attempt(attempt);
            prop_assert!(delay >= 0);
            let ceiling = (p.max_delay_ms as f64 * (1.0 + factor)).ceil() as i64;
            prop_assert!(delay <= ceiling);
        }

        #[test]
        fn undithered_backoff_is_monotone_up_to_clamp(attempt in 0u32..30, base in 1_000i64..10_000) {
            let p = policy(BackoffStrategy::Exponential, base, 3_600_000);
            prop_assert!(p.delay_for_attempt(attempt + 1) >= p.delay_for_attempt(attempt));
        }
    }
}
