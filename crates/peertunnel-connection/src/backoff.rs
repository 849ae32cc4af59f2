//! Reconnection delay with uniform jitter
//!
//! Every retry waits a uniformly random delay in `[0, max_jitter)`. The delay
//! does not grow with consecutive failures.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Exclusive upper bound of the retry delay
    pub max_jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_jitter: Duration::from_millis(1000),
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Retry pacing for one listener
pub struct JitterBackoff {
    config: ReconnectConfig,
    attempt: usize,
}

impl JitterBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Draw the next delay
    pub fn next_delay(&self) -> Duration {
        let max = self.config.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }

    /// Wait before the next attempt, or stop early when `cancel` fires
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<Duration, ReconnectError> {
        self.attempt += 1;

        let delay = self.next_delay();
        debug!(
            "Waiting {}ms before reconnection attempt {}",
            delay.as_millis(),
            self.attempt
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = sleep(delay) => Ok(delay),
        }
    }

    /// Reset attempt counter (call after successful registration)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_delay_within_bounds() {
        let backoff = JitterBackoff::new(ReconnectConfig::default());
        for _ in 0..1000 {
            assert!(backoff.next_delay() < Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_delay_does_not_grow() {
        let config = ReconnectConfig {
            max_jitter: Duration::from_millis(50),
        };
        let mut backoff = JitterBackoff::new(config);
        backoff.attempt = 10_000;
        for _ in 0..100 {
            assert!(backoff.next_delay() < Duration::from_millis(50));
        }
    }

    #[test]
    fn test_zero_jitter() {
        let config = ReconnectConfig {
            max_jitter: Duration::ZERO,
        };
        assert_eq!(JitterBackoff::new(config).next_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_drawn_delay() {
        let mut backoff = JitterBackoff::new(ReconnectConfig::default());
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let delay = backoff.wait(&cancel).await.unwrap();
        assert!(delay < Duration::from_millis(1000));
        assert!(start.elapsed() >= delay);
        assert_eq!(backoff.attempt(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let mut backoff = JitterBackoff::new(ReconnectConfig::default());
        let cancel = CancellationToken::new();

        backoff.wait(&cancel).await.unwrap();
        backoff.wait(&cancel).await.unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let config = ReconnectConfig {
            max_jitter: Duration::from_secs(3600),
        };
        let mut backoff = JitterBackoff::new(config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = backoff.wait(&cancel).await;
        assert_eq!(result, Err(ReconnectError::Cancelled));
    }
}
