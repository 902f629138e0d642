use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use warden_settings::BackoffSettings;

/// Suspension policy parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the computed delay, in `[0, 1]`.
    pub jitter_factor: f64,
    /// Depth after a reset. Negative values allow that many zero-delay attempts.
    pub initial_depth: i32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
            initial_depth: -1,
        }
    }
}

impl From<&BackoffSettings> for BackoffConfig {
    fn from(settings: &BackoffSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter_factor: settings.jitter_factor.clamp(0.0, 1.0),
            initial_depth: settings.initial_depth,
        }
    }
}

/// Attempt-depth counter that turns failures into a jittered linear delay.
///
/// `next_delay()` is `min(max_delay, base_delay * max(0, depth))` scaled by a
/// random factor in `[1 - jitter, 1 + jitter]`.
pub struct Backoff {
    config: BackoffConfig,
    depth: AtomicI32,
    rng: Mutex<StdRng>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self {
            depth: AtomicI32::new(config.initial_depth),
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn depth(&self) -> i32 {
        self.depth.load(Ordering::Acquire)
    }

    /// The un-jittered delay for the current depth.
    pub fn base_delay(&self) -> Duration {
        let depth = self.depth().max(0) as u32;
        self.config
            .base_delay
            .saturating_mul(depth)
            .min(self.config.max_delay)
    }

    pub fn next_delay(&self) -> Duration {
        let base = self.base_delay();
        if base.is_zero() || self.config.jitter_factor <= 0.0 {
            return base;
        }
        let r: f64 = self.rng.lock().gen_range(-1.0..=1.0);
        let factor = (1.0 + r * self.config.jitter_factor).max(0.0);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Record a failed attempt. Returns the new depth.
    pub fn increase(&self) -> i32 {
        let previous = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_add(1))
            })
            .unwrap_or_else(|d| d);
        previous.saturating_add(1)
    }

    pub fn reset(&self) {
        self.depth.store(self.config.initial_depth, Ordering::Release);
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("config", &self.config)
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter_factor: f64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_factor,
            initial_depth: -1,
        }
    }

    fn within(delay: Duration, base: Duration, jitter: f64) -> bool {
        let d = delay.as_secs_f64();
        let b = base.as_secs_f64();
        d >= b * (1.0 - jitter) - 1e-9 && d <= b * (1.0 + jitter) + 1e-9
    }

    #[test]
    fn negative_floor_grants_zero_delay_attempts() {
        let backoff = Backoff::with_seed(config(0.1), 7);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        backoff.increase();
        assert_eq!(backoff.depth(), 0);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn linear_growth_without_jitter() {
        let backoff = Backoff::with_seed(config(0.0), 1);
        for _ in 0..4 {
            backoff.increase();
        }
        assert_eq!(backoff.depth(), 3);
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
    }

    #[test]
    fn capped_at_max_delay() {
        let backoff = Backoff::with_seed(config(0.0), 1);
        for _ in 0..50 {
            backoff.increase();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let backoff = Backoff::with_seed(config(0.1), 42);
        for failures in 1..=15 {
            backoff.increase();
            let base = backoff.base_delay();
            for _ in 0..20 {
                let delay = backoff.next_delay();
                assert!(
                    within(delay, base, 0.1),
                    "failures={failures} delay={delay:?} base={base:?}"
                );
            }
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = Backoff::with_seed(config(0.5), 9);
        let b = Backoff::with_seed(config(0.5), 9);
        for _ in 0..5 {
            a.increase();
            b.increase();
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn reset_returns_to_floor() {
        let backoff = Backoff::with_seed(config(0.1), 3);
        for _ in 0..6 {
            backoff.increase();
        }
        assert!(!backoff.next_delay().is_zero());
        backoff.reset();
        assert_eq!(backoff.depth(), -1);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn increase_saturates() {
        let backoff = Backoff::with_seed(
            BackoffConfig {
                initial_depth: i32::MAX - 1,
                ..config(0.0)
            },
            1,
        );
        assert_eq!(backoff.increase(), i32::MAX);
        assert_eq!(backoff.increase(), i32::MAX);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn from_settings() {
        let settings = BackoffSettings {
            base_delay_ms: 250,
            max_delay_ms: 2_000,
            jitter_factor: 0.2,
            initial_depth: -2,
        };
        let config = BackoffConfig::from(&settings);
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(2));
        assert_eq!(config.initial_depth, -2);
    }
}
