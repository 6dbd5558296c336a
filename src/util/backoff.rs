use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub max_delay_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: DEFAULT_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_millis: DEFAULT_MAX_DELAY_MILLIS,
        }
    }
}

/// Exponential backoff with +/-50% jitter.
///
/// The first attempt after a `reset` runs without delay. Each call to
/// `next_delay` returns the delay to wait before the next attempt (minus the
/// time already spent since the previous attempt) and grows the base delay by
/// `backoff_factor`, clamped to `[initial_delay, max_delay]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base_millis: u64,
    last_attempt_millis: i64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base_millis: 0,
            last_attempt_millis: now_millis(),
        }
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }

    pub fn current_base_millis(&self) -> u64 {
        self.current_base_millis
    }

    /// Next attempt runs immediately.
    pub fn reset(&mut self) {
        self.current_base_millis = 0;
    }

    /// Next attempt waits the maximum delay. Used when the backend reports
    /// that we are exhausting a quota.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.config.max_delay_millis;
    }

    /// Records that an attempt is starting now.
    pub fn mark_attempt(&mut self) {
        self.last_attempt_millis = now_millis();
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng(), now_millis())
    }

    pub(crate) fn next_delay_with_rng<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        now_millis: i64,
    ) -> Duration {
        let base = self.current_base_millis as f64;
        let jitter = (rng.gen::<f64>() - 0.5) * base;
        let desired = (base + jitter).floor().max(0.0) as i64;
        let elapsed = (now_millis - self.last_attempt_millis).max(0);
        let remaining = (desired - elapsed).max(0) as u64;
        if remaining > 0 {
            log::debug!(
                "Backing off for {remaining} ms (base delay: {} ms, delay with jitter: {desired} ms, last attempt: {elapsed} ms ago)",
                self.current_base_millis
            );
        }

        let grown = (base * self.config.backoff_factor) as u64;
        self.current_base_millis = grown.clamp(
            self.config.initial_delay_millis,
            self.config.max_delay_millis,
        );
        Duration::from_millis(remaining)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = ExponentialBackoff::default();
        let start = backoff.last_attempt_millis;
        assert_eq!(backoff.next_delay_with_rng(&mut rng, start), Duration::ZERO);
        assert_eq!(backoff.current_base_millis(), DEFAULT_INITIAL_DELAY_MILLIS);
    }

    #[test]
    fn delays_grow_within_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::default();
        let start = backoff.last_attempt_millis;
        backoff.next_delay_with_rng(&mut rng, start);

        let mut expected_base = DEFAULT_INITIAL_DELAY_MILLIS as f64;
        for _ in 0..20 {
            let delay = backoff.next_delay_with_rng(&mut rng, start).as_millis() as f64;
            assert!(delay >= (expected_base * 0.5).floor());
            assert!(delay <= expected_base * 1.5);
            expected_base =
                (expected_base * DEFAULT_BACKOFF_FACTOR).min(DEFAULT_MAX_DELAY_MILLIS as f64);
        }
        assert_eq!(backoff.current_base_millis(), DEFAULT_MAX_DELAY_MILLIS);
    }

    #[test]
    fn elapsed_time_counts_against_delay() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut backoff = ExponentialBackoff::default();
        let start = backoff.last_attempt_millis;
        backoff.reset_to_max();
        let delay = backoff.next_delay_with_rng(&mut rng, start + 120_000);
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn reset_to_max_then_reset() {
        let mut backoff = ExponentialBackoff::default();
        backoff.reset_to_max();
        assert_eq!(backoff.current_base_millis(), DEFAULT_MAX_DELAY_MILLIS);
        backoff.reset();
        assert_eq!(backoff.current_base_millis(), 0);
    }
}
