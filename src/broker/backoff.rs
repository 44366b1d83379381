//! Exponential backoff with jitter, shared by every broker retry path.

use std::time::Duration;

use rand::Rng;

/// Immutable retry schedule. One policy is built from config and copied
/// into every reconnect and resubscribe loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Growth factor between consecutive attempts.
    pub multiplier: u32,
    /// Fraction of the delay (0.0..=1.0) that may be shaved off at random.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            multiplier: 2,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            ..Self::default()
        }
    }

    /// Un-jittered delay for the given zero-based attempt, capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Start a fresh retry sequence.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Mutable retry state for one loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Delay to sleep before the next retry. Advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let shave = rand::thread_rng().gen_range(0.0..=jitter);
        base.mul_f64(1.0 - shave)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(6), Duration::from_secs(2));
        assert_eq!(policy.delay_for(60), Duration::from_secs(2));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        let mut backoff = policy.start();
        for attempt in 0..12 {
            let base = policy.delay_for(attempt);
            let delay = backoff.next_delay();
            assert!(delay <= base, "attempt {attempt}: {delay:?} > {base:?}");
            assert!(delay >= base.mul_f64(0.8) - Duration::from_micros(1));
        }
        assert_eq!(backoff.attempts(), 12);
    }

    #[test]
    fn reset_restarts_sequence() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        let mut backoff = policy.start();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn max_is_never_below_initial() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }
}
