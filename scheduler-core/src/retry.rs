//! Retry scheduler: a pure function over the task's retry policy and the
//! current attempt count.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStyle {
    Exponential,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff: BackoffStyle,
    pub base_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStyle::Exponential,
            base_seconds: 30,
        }
    }
}

/// What the retry scheduler decided to do with an occurrence after a
/// `Retry` outcome.
pub enum RetryDecision {
    /// Attempts remain; re-enqueue at this UTC instant.
    RetryAt(DateTime<Utc>),
    /// Attempts exhausted; the occurrence is terminally failed.
    Exhausted,
}

/// Compute the backoff delay for the given attempt, in seconds, including
/// additive jitter. Jitter is bounded by `base_seconds` regardless of
/// attempt number — this preserves the source implementation's semantics
/// rather than scaling jitter with the exponential delay.
pub fn backoff_seconds(policy: &RetryPolicy, attempt_no: i32) -> f64 {
    let base = policy.base_seconds as f64;
    let delay = match policy.backoff {
        BackoffStyle::Exponential => base * 2f64.powi((attempt_no - 1).max(0)),
        BackoffStyle::Constant => base,
    };
    let jitter = rand::thread_rng().gen_range(0.0..base.max(f64::EPSILON));
    delay + jitter
}

/// Decide whether an occurrence that failed with a retryable error should
/// be retried, and if so, when.
pub fn decide(policy: &RetryPolicy, attempt_no: i32, finished_at: DateTime<Utc>) -> RetryDecision {
    if attempt_no >= policy.max_attempts {
        return RetryDecision::Exhausted;
    }
    let delay = backoff_seconds(policy, attempt_no);
    let millis = (delay * 1000.0).round() as i64;
    RetryDecision::RetryAt(finished_at + ChronoDuration::milliseconds(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffStyle::Exponential,
            base_seconds: 10,
        };
        // jitter is in [0, base), so subtract it out by checking the floor.
        assert!(backoff_seconds(&policy, 1) >= 10.0);
        assert!(backoff_seconds(&policy, 1) < 20.0);
        assert!(backoff_seconds(&policy, 2) >= 20.0);
        assert!(backoff_seconds(&policy, 2) < 30.0);
        assert!(backoff_seconds(&policy, 3) >= 40.0);
        assert!(backoff_seconds(&policy, 3) < 50.0);
    }

    #[test]
    fn constant_backoff_does_not_scale_with_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffStyle::Constant,
            base_seconds: 10,
        };
        assert!(backoff_seconds(&policy, 4) >= 10.0);
        assert!(backoff_seconds(&policy, 4) < 20.0);
    }

    #[test]
    fn jitter_never_scales_with_attempt_number() {
        // The jitter bound itself (base_seconds) is attempt-independent;
        // only the base delay grows. Verify the jitter component alone
        // never exceeds base regardless of how high attempt_no climbs.
        let policy = RetryPolicy {
            max_attempts: 100,
            backoff: BackoffStyle::Exponential,
            base_seconds: 5,
        };
        for attempt in [1, 10, 50] {
            let delay = backoff_seconds(&policy, attempt);
            let base_component = 5.0 * 2f64.powi((attempt - 1).max(0));
            let jitter_component = delay - base_component;
            assert!(jitter_component >= 0.0 && jitter_component < 5.0);
        }
    }

    #[test]
    fn exhausted_when_attempt_reaches_max() {
        let policy = RetryPolicy::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(decide(&policy, 3, now), RetryDecision::Exhausted));
    }

    #[test]
    fn retries_while_attempts_remain() {
        let policy = RetryPolicy::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        match decide(&policy, 1, now) {
            RetryDecision::RetryAt(at) => assert!(at > now),
            RetryDecision::Exhausted => panic!("should not be exhausted"),
        }
    }
}
