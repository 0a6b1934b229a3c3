//! Exponential backoff for the reconnect loop

use std::time::Duration;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Maximum number of failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Attempt counter and current delay of the reconnect loop
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_delay: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_delay: config.initial_delay.min(config.max_delay),
            config,
            attempt: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next one
    ///
    /// Returns `None` once the configured maximum attempt count is exceeded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return None;
            }
        }

        let delay = self.current_delay;
        let next = Duration::from_secs_f64(delay.as_secs_f64() * self.config.multiplier);
        self.current_delay = next.min(self.config.max_delay);

        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "Backoff advanced");
        Some(delay)
    }

    /// Reset after a successful admission
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.current_delay = self.config.initial_delay.min(self.config.max_delay);
        self.attempt = 0;
    }

    /// Number of failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next failure will be given
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let mut backoff = Backoff::new(config(None));

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(80)));
        // Should cap at max_delay
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_backoff_resets_on_success() {
        let mut backoff = Backoff::new(config(None));
        let first = backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), first);
    }

    #[test]
    fn test_max_attempts() {
        let mut backoff = Backoff::new(config(Some(3)));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.max_attempts(), Some(3));
    }

    #[test]
    fn test_zero_max_attempts_never_retries() {
        let mut backoff = Backoff::new(config(Some(0)));
        assert_eq!(backoff.next_delay(), None);
    }
}
