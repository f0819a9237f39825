// Exponential backoff with a cap and random jitter

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound on the exponential part
    pub max: Duration,
    /// Up to this fraction of the delay is added at random (0.0 disables)
    pub jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            // NaN survives clamp and would poison the jitter range
            jitter: if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) },
        }
    }

    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max`, then stretched by a random jitter share.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_nan() || self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.25)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0.25);
        for attempt in 0..10 {
            let base = backoff.base_delay(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.25) + Duration::from_micros(1));
        }
    }

    #[test]
    fn test_jitter_clamped() {
        assert_eq!(Backoff::new(Duration::ZERO, Duration::ZERO, 7.0).jitter, 1.0);
        assert_eq!(Backoff::new(Duration::ZERO, Duration::ZERO, 7.0).delay(3), Duration::ZERO);
    }

    #[test]
    fn test_nan_jitter_disabled() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), f64::NAN);
        assert_eq!(backoff.jitter, 0.0);
        assert_eq!(backoff.delay(2), Duration::from_millis(40));
        let infinite = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), f64::INFINITY);
        assert_eq!(infinite.jitter, 1.0);
        assert!(infinite.delay(0) <= Duration::from_millis(20));

        // Fields are public, so a NaN can also arrive without `new`
        let direct = Backoff {
            jitter: f64::NAN,
            ..backoff
        };
        assert_eq!(direct.delay(0), Duration::from_millis(10));
    }
}
