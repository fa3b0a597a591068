//! Reconnect backoff.

use std::time::Duration;

use docsync_core::FeedOptions;
use rand::Rng;

/// Capped exponential backoff with additive random jitter.
///
/// Retries are unbounded; the delay just stops growing at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(options: &FeedOptions) -> Self {
        Self {
            initial: options.initial_backoff,
            max: options.max_backoff,
            multiplier: options.backoff_multiplier.max(1.0),
            jitter: options.jitter,
            current: options.initial_backoff,
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Advances the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.saturating_add(self.sample_jitter());
        let next = self.current.as_secs_f64() * self.multiplier;
        self.current = Duration::try_from_secs_f64(next)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Back to the initial delay, after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Consecutive attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn sample_jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn options(jitter_ms: u64) -> FeedOptions {
        FeedOptions {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(jitter_ms),
            ..FeedOptions::default()
        }
    }

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(&options(0));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.attempts(), 7);
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new(&options(0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 1);
    }

    proptest! {
        #[test]
        fn prop_delay_stays_within_cap_plus_jitter(
            jitter_ms in 0u64..1_000,
            steps in 1usize..40,
        ) {
            let mut backoff = Backoff::new(&options(jitter_ms));
            let ceiling = Duration::from_secs(30) + Duration::from_millis(jitter_ms);
            let mut previous_base = Duration::ZERO;
            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= Duration::from_secs(1));
                prop_assert!(delay <= ceiling);
                prop_assert!(backoff.current >= previous_base);
                previous_base = backoff.current;
            }
        }
    }
}
