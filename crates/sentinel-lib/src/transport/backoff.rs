//! Exponential reconnection backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Default first retry delay
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Default ceiling for retry delays
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff: doubles per attempt up to a cap, with full jitter
/// (uniform between zero and the ceiling) so reconnecting agents spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay, before jitter
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_respect_cap() {
        let mut backoff = Backoff::default();
        let mut last_ceiling = Duration::ZERO;

        for _ in 0..20 {
            let ceiling = backoff.ceiling();
            let delay = backoff.next_delay();
            assert!(ceiling >= last_ceiling);
            assert!(delay <= ceiling);
            assert!(delay <= DEFAULT_MAX_BACKOFF);
            last_ceiling = ceiling;
        }
        assert_eq!(backoff.ceiling(), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_spans_full_range() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(1000));
        let delays: Vec<Duration> = (0..200).map(|_| backoff.next_delay()).collect();

        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1000)));
        // Equal jitter would never go below half the ceiling
        assert!(delays.iter().any(|d| *d < Duration::from_millis(500)));
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        assert_eq!(backoff.ceiling(), Duration::from_millis(400));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.ceiling(), Duration::from_millis(100));
    }
}
