//! Bounded exponential backoff for handler retries.
//!
//! The dispatcher retries a failing handler a few times locally so a
//! single transient blip does not immediately bounce the record back to
//! the broker. Once [`RetryPolicy::max_attempts`] is used up the record is
//! handed back and the broker's own redelivery takes over.

use std::time::Duration;

/// Tunable parameters for local handler retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total handler invocations per delivery, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that invokes the handler once and never waits.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Calculate the next backoff delay from the current one.
    ///
    /// The result is clamped to [`max_backoff`](Self::max_backoff).
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_backoff)
    }

    /// The delays slept between consecutive attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let gaps = self.max_attempts.saturating_sub(1) as usize;
        std::iter::successors(Some(self.initial_backoff.min(self.max_backoff)), |d| {
            Some(self.next_delay(*d))
        })
        .take(gaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_delay(Duration::from_millis(200)),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(
            policy.next_delay(Duration::from_millis(800)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn delays_cover_gaps_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 3.0,
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 300, 500, 500]);
    }

    #[test]
    fn no_retry_never_waits() {
        assert_eq!(RetryPolicy::no_retry().delays().count(), 0);
    }
}
