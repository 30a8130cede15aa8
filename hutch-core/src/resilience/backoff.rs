//! Exponential backoff for retry logic
//!
//! `delay(attempt) = min(base * 2^attempt, max) + uniform(0, jitter_window)`
//!
//! The jitter spreads retries from many processes so they do not hit a
//! recovering broker in lockstep.

use rand::Rng;
use std::time::Duration;

/// Configuration for exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay for attempt 0 (before jitter)
    pub base_delay: Duration,
    /// Cap applied before jitter is added
    pub max_delay: Duration,
    /// Upper bound of the random extra delay
    pub jitter_window: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            jitter_window: Duration::from_millis(1000),
        }
    }
}

impl BackoffConfig {
    /// Configuration without jitter (deterministic delays)
    pub fn without_jitter(self) -> Self {
        Self {
            jitter_window: Duration::ZERO,
            ..self
        }
    }

    /// Capped exponential delay for `attempt`, without jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u128.checked_pow(attempt).unwrap_or(u128::MAX);
        let raw_ms = self.base_delay.as_millis().saturating_mul(factor);
        let capped_ms = raw_ms.min(self.max_delay.as_millis());
        Duration::from_millis(u64::try_from(capped_ms).unwrap_or(u64::MAX))
    }

    /// Delay for `attempt` with random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_window.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen::<f64>()
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// Delay with an explicit jitter fraction in `[0.0, 1.0]` (for testing)
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(0.0, 1.0);
        self.base_delay_for(attempt) + self.jitter_window.mul_f64(jitter)
    }

    /// Largest value `delay` can ever return
    pub fn upper_bound(&self) -> Duration {
        self.max_delay + self.jitter_window
    }
}

/// Linear backoff used between channel creation attempts
///
/// `attempt` is 1-based: the first retry waits `step`, the second `2 * step`.
pub fn linear_delay(step: Duration, attempt: u32) -> Duration {
    step.saturating_mul(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(base_ms: u64, max_ms: u64, jitter_ms: u64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_window: Duration::from_millis(jitter_ms),
        }
    }

    #[test]
    fn test_backoff_exponential_growth() {
        let backoff = config(1000, 100_000, 0);

        assert_eq!(backoff.delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_max_delay() {
        let backoff = config(1000, 10_000, 0);

        assert_eq!(backoff.delay(3), Duration::from_millis(8000));
        assert_eq!(backoff.delay(4), Duration::from_millis(10_000));
        assert_eq!(backoff.delay(40), Duration::from_millis(10_000));
        // Huge attempt counts saturate instead of overflowing
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn test_backoff_jitter_window() {
        let backoff = config(1000, 10_000, 500);

        assert_eq!(backoff.delay_with_jitter(0, 0.0), Duration::from_millis(1000));
        assert_eq!(backoff.delay_with_jitter(0, 1.0), Duration::from_millis(1500));
        assert_eq!(backoff.delay_with_jitter(0, 0.5), Duration::from_millis(1250));
        // Out-of-range jitter is clamped
        assert_eq!(backoff.delay_with_jitter(0, 7.0), Duration::from_millis(1500));
    }

    #[test]
    fn test_backoff_jitter_varies() {
        let backoff = config(100, 1000, 1000);

        let delays: Vec<_> = (0..5).map(|_| backoff.delay(0)).collect();
        // With jitter, these should not all be exactly equal
        // (small chance of false positive, but very unlikely)
        assert!(delays.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_without_jitter() {
        let backoff = config(100, 1000, 1000).without_jitter();
        assert_eq!(backoff.delay(1), backoff.delay(1));
        assert_eq!(backoff.upper_bound(), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_delay() {
        let step = Duration::from_millis(1000);
        assert_eq!(linear_delay(step, 1), Duration::from_millis(1000));
        assert_eq!(linear_delay(step, 3), Duration::from_millis(3000));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_bound(
            base in 1u64..5_000,
            extra in 0u64..60_000,
            jitter in 0u64..5_000,
            attempt in 0u32..200,
        ) {
            let backoff = config(base, base + extra, jitter);
            prop_assert!(backoff.delay(attempt) <= backoff.upper_bound());
        }

        #[test]
        fn prop_base_delay_non_decreasing(
            base in 1u64..5_000,
            extra in 0u64..60_000,
            attempt in 0u32..200,
        ) {
            let backoff = config(base, base + extra, 0);
            prop_assert!(backoff.base_delay_for(attempt) <= backoff.base_delay_for(attempt + 1));
        }
    }
}
