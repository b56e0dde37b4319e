use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlflow_core::RetryConfig;

/// Exponential backoff with a small jitter, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            factor: config.backoff_factor.max(1.0),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            factor: 1.0,
        }
    }

    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self.clone()
        }
    }

    /// Delay before the attempt following `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_backoff.as_millis() as f64 * self.factor.powi(exp);
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }

    /// Backoff plus up to 100ms of jitter. Zero backoff stays zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() {
            return base;
        }
        // Jitter without rand: nanosecond fraction of the current time.
        let jitter_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos()
            % 100;
        base + Duration::from_millis(jitter_ms as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        let policy = RetryPolicy::default(); // 200ms, x1.5, cap 2000ms
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(300));
        assert_eq!(policy.base_delay(3), Duration::from_millis(450));
        assert_eq!(policy.base_delay(20), Duration::from_millis(2000));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 1..10 {
            let base = policy.base_delay(attempt);
            let d = policy.delay(attempt);
            assert!(d >= base && d < base + Duration::from_millis(100));
        }
    }

    #[test]
    fn immediate_never_sleeps() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.with_max_attempts(0).max_attempts, 1);
    }
}
