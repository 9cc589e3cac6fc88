//! Reconnect backoff.

use std::time::Duration;

use crate::types::ReconnectConfig;

/// Delay schedule for consecutive connect attempts.
///
/// The first attempt after a reset is immediate. Each later attempt waits
/// `initial_delay * 2^(n-1)` (n = failures so far), capped at `max_delay`.
/// Once `max_attempts` attempts have been made without a success,
/// [`next_delay`](Backoff::next_delay) returns `None`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` when out of attempts.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }

        let delay = match self.attempts {
            0 => Duration::ZERO,
            n => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                self.initial_delay
                    .checked_mul(factor)
                    .map_or(self.max_delay, |d| d.min(self.max_delay))
            }
        };
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    /// Forget past failures; called after a successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
