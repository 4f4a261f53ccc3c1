//! Retry delays for polling backends that learn things asynchronously
//! (e.g., the address a container was published on).
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`. With
//! jitter enabled a uniformly random share of up to half the delay is
//! subtracted so concurrent pollers spread out.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(50),
            max: Duration::from_secs(2),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };

        if !self.jitter || base.is_zero() {
            return base;
        }
        let half = base / 2;
        let cut = rand::thread_rng().gen_range(Duration::ZERO..=half);
        base - cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn grows_exponentially() {
        let policy = no_jitter();
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(2), Duration::from_millis(400));
    }

    #[test]
    fn clamps_to_max() {
        let policy = no_jitter();
        assert_eq!(policy.next(10), Duration::from_secs(1));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_of_base() {
        let policy = BackoffPolicy {
            jitter: true,
            ..no_jitter()
        };
        for attempt in 0..8 {
            let ceiling = no_jitter().next(attempt);
            let delay = policy.next(attempt);
            assert!(delay <= ceiling, "attempt {}: {:?} > {:?}", attempt, delay, ceiling);
            assert!(delay >= ceiling / 2, "attempt {}: {:?} < half", attempt, delay);
        }
    }
}
