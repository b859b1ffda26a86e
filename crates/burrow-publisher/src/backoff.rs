//! Exponential backoff for the control-channel connect loop

use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Doubling, capped retry delay.
///
/// Starts at one second; every failed attempt doubles the delay up to one
/// minute. A successful connection resets it.
#[derive(Debug)]
pub struct RetryContext {
    current: Duration,
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            current: BASE_DELAY,
        }
    }

    /// Delay to sleep before the next attempt; escalates for the one after
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_DELAY);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BASE_DELAY;
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_capped() {
        let mut retry = RetryContext::new();
        let mut delays = Vec::new();
        for _ in 0..9 {
            delays.push(retry.next_delay().as_millis());
        }
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000, 60000]
        );
    }

    #[test]
    fn test_reset_restores_base() {
        let mut retry = RetryContext::new();
        retry.next_delay();
        retry.next_delay();
        retry.reset();
        assert_eq!(retry.next_delay(), Duration::from_secs(1));
    }
}
