//! Client configuration.

use std::time::Duration;
use url::Url;

/// Configuration for the nvent client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the nvent server.
    pub base_url: Url,
    /// Request timeout.
    pub timeout: Duration,
    /// Retry configuration for HTTP calls.
    pub retry: RetryConfig,
    /// Reconnect configuration for the WebSocket feed.
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Retry behavior for HTTP calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Backoff for the given zero-based attempt, doubling per attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.initial_backoff.saturating_mul(1u32 << attempt.min(16));
        backoff.min(self.max_backoff)
    }
}

/// WebSocket reconnect behavior: exponential backoff from 1 s capped at
/// 10 s, jittered.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the delay randomized away (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(8))
            .min(self.max_backoff);
        let jitter = base.mul_f64(self.jitter * rand::random::<f64>());
        base - jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_backoff_doubles_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn reconnect_delay_stays_within_bounds() {
        let config = ReconnectConfig::default();
        for attempt in 0..12 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_secs(10));
            assert!(delay >= Duration::from_millis(800) || attempt == 0);
        }
    }
}
