//! Reconnect delays: exponential growth, randomized by a jitter factor and
//! capped at `max_ms`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    /// Relative jitter, 0.2 = +/-20%
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            multiplier: 2.0,
            max_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl BackoffSettings {
    /// Delay before retry number `attempt` (1-based) without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let growth = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_ms as f64 * growth).min(self.max_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let millis = (base * factor).min(self.max_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_exponential_growth_capped() {
        let backoff = BackoffSettings {
            initial_ms: 100,
            multiplier: 2.0,
            max_ms: 1000,
            jitter: 0.0,
        };
        assert_eq!(backoff.base_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.base_delay(4), Duration::from_millis(800));
        assert_eq!(backoff.base_delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.base_delay(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = BackoffSettings {
            initial_ms: 1000,
            multiplier: 2.0,
            max_ms: 60_000,
            jitter: 0.25,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = backoff.delay(1, &mut rng).as_millis();
            assert!((750..=1250).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let backoff = BackoffSettings {
            initial_ms: 1000,
            multiplier: 3.0,
            max_ms: 5000,
            jitter: 0.5,
        };
        let mut rng = StdRng::seed_from_u64(1);
        for attempt in 1..20 {
            assert!(backoff.delay(attempt, &mut rng) <= Duration::from_millis(5000));
        }
    }
}
