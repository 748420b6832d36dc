//! Exponential backoff with jitter.

use std::time::{Duration, SystemTime};

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any delay (before jitter).
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let delay_ms = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        let jittered = delay_ms + delay_ms * self.jitter * unit_noise();
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Cheap noise in [-1.0, 1.0] from the clock; retries only need spreading,
/// not randomness.
fn unit_noise() -> f64 {
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (mixed >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.2,
        };
        assert!(policy.delay(20) <= Duration::from_secs(6));
    }
}
