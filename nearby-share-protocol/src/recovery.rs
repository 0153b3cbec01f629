//! Retry Backoff
//!
//! Exponential backoff used by the device registry when a discovery scan
//! fails. Delays double on every attempt up to a fixed ceiling and reset
//! once a scan succeeds.

use crate::config::{DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX};
use std::time::Duration;

/// Exponential backoff with a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Failed attempts since the last reset
    pub attempt: u32,
    /// Delay returned by the next call to `next_delay`
    pub current_delay: Duration,
    /// First delay after a reset
    pub initial_delay: Duration,
    /// Ceiling for the delay
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX)
    }
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            current_delay: initial_delay.min(max_delay),
            initial_delay,
            max_delay,
        }
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay.min(self.max_delay);
    }

    /// Get next delay and double the one after it
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt = self.attempt.saturating_add(1);
        self.current_delay = std::cmp::min(self.current_delay.saturating_mul(2), self.max_delay);
        delay
    }

    /// Get human-readable status
    pub fn status(&self) -> String {
        format!(
            "Attempt {}, next delay: {:?} (max {:?})",
            self.attempt, self.current_delay, self.max_delay
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        let delays: Vec<Duration> = (0..9).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[6], Duration::from_secs(30));
        assert_eq!(delays[8], Duration::from_secs(30));
        assert_eq!(backoff.attempt, 9);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempt, 0);
        assert_eq!(backoff.next_delay(), DEFAULT_BACKOFF_INITIAL);
    }

    #[test]
    fn test_initial_above_ceiling_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }
}
