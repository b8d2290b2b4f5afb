//! Linear reconnect backoff

use crate::config::ConnectionConfig;
use std::time::Duration;

/// Reconnect delays growing by a fixed increment per consecutive failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    increment: Duration,
    max: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(base: Duration, increment: Duration, max: Duration) -> Self {
        Self {
            base,
            increment,
            max,
            attempts: 0,
        }
    }

    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_increment_ms),
            Duration::from_millis(config.reconnect_max_ms),
        )
    }

    /// Delay before the next scheduled attempt: `base + (n-1) * increment`
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let delay = self
            .base
            .saturating_add(self.increment.saturating_mul(self.attempts - 1));
        delay.min(self.max)
    }

    /// Back to `base` after a successful connect
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delays handed out since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_linear_growth() {
        let mut policy = policy();
        let delays: Vec<u64> = (0..4).map(|_| policy.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 15, 20]);
        assert_eq!(policy.attempts(), 4);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut policy = policy();
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_capped() {
        let mut policy = policy();
        let last = (0..30).map(|_| policy.next_delay()).last();
        assert_eq!(last, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_config_defaults() {
        let mut policy = ReconnectPolicy::from_config(&ConnectionConfig::default());
        assert_eq!(policy.next_delay(), Duration::from_secs(5));
        assert_eq!(policy.next_delay(), Duration::from_secs(10));
    }
}
