// ── Reconnect backoff ───────────────────────────────────────────────
//
// Shared by the Miniserver session and the delivery channels.

use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 60s.
    pub max_delay: Duration,

    /// Consecutive failed attempts before giving up. `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// `min(initial * 2^attempt, max)`; never decreases as `attempt` grows.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Tracks consecutive failures against a [`ReconnectConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Consecutive failures since the last [`reset`](Self::reset).
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or `None` once the
    /// budget is used up.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.exhausted() {
            return None;
        }
        Some(self.config.delay_for(self.failures - 1))
    }

    pub fn exhausted(&self) -> bool {
        self.config.max_attempts != 0 && self.failures >= self.config.max_attempts
    }

    /// Forget past failures after a successful period.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 0);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 0,
        };
        let delays: Vec<_> = (0..40).map(|a| config.delay_for(a)).collect();

        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[39], Duration::from_secs(10));
    }

    #[test]
    fn budget_of_three_allows_three_attempts() {
        let mut backoff = Backoff::new(ReconnectConfig {
            max_attempts: 3,
            ..ReconnectConfig::default()
        });
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_none());
        assert!(backoff.exhausted());
        assert_eq!(backoff.failures(), 3);
    }

    #[test]
    fn zero_budget_never_exhausts() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        for _ in 0..1000 {
            assert!(backoff.record_failure().is_some());
        }
        assert!(!backoff.exhausted());
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.record_failure(), Some(Duration::from_secs(4)));

        backoff.reset();
        assert_eq!(backoff.record_failure(), Some(Duration::from_secs(1)));
    }
}
