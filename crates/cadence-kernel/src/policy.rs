//! Retry-with-backoff policy shared by the lease manager (§4.E, due-work
//! retries) and the pipeline executor (§4.J, per-step retries).
//!
//! `delay = min(max_delay, base_delay * 2^(attempt-1)) * (1 + U(-jitter, +jitter))`

use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Source of the uniform jitter sample in `[-ratio, ratio]`. Abstracted so
/// tests can pin the sample (typically to `0.0`) and get reproducible delays.
pub trait JitterSource: Send + Sync {
    fn sample(&self, ratio: f64) -> f64;
}

/// Draws from the thread-local RNG. Used in production.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self, ratio: f64) -> f64 {
        if ratio <= 0.0 {
            return 0.0;
        }
        use rand::Rng;
        rand::thread_rng().gen_range(-ratio..=ratio)
    }
}

/// Always returns a fixed offset. Used in tests (§8 property 5, scenario S3).
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self, _ratio: f64) -> f64 {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::seconds(1),
            max_delay: Duration::seconds(300),
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// `attempt` is the attempt number that just failed (1-indexed, matching the
/// due-work `attempt` counter semantics in §3/§4.E).
pub fn decide(attempt: u32, policy: &RetryPolicy, jitter: &dyn JitterSource) -> RetryDecision {
    if attempt >= policy.max_attempts {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry {
        delay: backoff_delay(attempt, policy, jitter),
    }
}

fn backoff_delay(attempt: u32, policy: &RetryPolicy, jitter: &dyn JitterSource) -> Duration {
    let exp = 2_i64.saturating_pow(attempt.saturating_sub(1));
    let raw = policy
        .base_delay
        .checked_mul(exp as i32)
        .unwrap_or(policy.max_delay);
    let capped = raw.min(policy.max_delay).max(Duration::zero());

    let sample = jitter.sample(policy.jitter_ratio);
    let capped_ms = capped.num_milliseconds() as f64;
    let jittered_ms = (capped_ms * (1.0 + sample)).max(0.0);
    Duration::milliseconds(jittered_ms.round() as i64)
}

pub fn to_std(delay: Duration) -> StdDuration {
    delay.to_std().unwrap_or(StdDuration::from_secs(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_jitter_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::seconds(1),
            max_delay: Duration::seconds(10),
            jitter_ratio: 0.0,
        };
        let jitter = FixedJitter(0.0);

        let d1 = backoff_delay(1, &policy, &jitter);
        let d2 = backoff_delay(2, &policy, &jitter);
        let d3 = backoff_delay(3, &policy, &jitter);
        let d5 = backoff_delay(5, &policy, &jitter);

        assert_eq!(d1, Duration::seconds(1));
        assert_eq!(d2, Duration::seconds(2));
        assert_eq!(d3, Duration::seconds(4));
        assert_eq!(d5, Duration::seconds(10), "capped at max_delay");
    }

    #[test]
    fn give_up_once_max_attempts_reached() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let jitter = FixedJitter(0.0);
        assert!(matches!(decide(1, &policy, &jitter), RetryDecision::Retry { .. }));
        assert!(matches!(decide(2, &policy, &jitter), RetryDecision::Retry { .. }));
        assert_eq!(decide(3, &policy, &jitter), RetryDecision::GiveUp);
    }

    #[test]
    fn positive_jitter_increases_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::seconds(10),
            max_delay: Duration::seconds(1000),
            jitter_ratio: 0.2,
        };
        let jitter = FixedJitter(0.2);
        let d = backoff_delay(1, &policy, &jitter);
        assert_eq!(d, Duration::milliseconds(12_000));
    }
}
