//! # Fibonacci Backoff
//!
//! Retry delays for failed pool refreshes. The sequence grows more slowly
//! than exponential backoff and is capped, normally at the resync interval.
//! Sequence with a 5s minimum and 60s cap: 5s, 5s, 10s, 15s, 25s, 40s, 60s.

use std::time::Duration;

/// Fibonacci backoff calculator, in seconds.
///
/// Each backoff is the sum of the previous two backoffs.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff value in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values in seconds
    ///
    /// # Arguments
    ///
    /// * `min_seconds` - Minimum backoff duration (used for the first two values)
    /// * `max_seconds` - Maximum backoff duration (caps the sequence)
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        let max_seconds = max_seconds.max(min_seconds);
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;
        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = next.min(self.max_seconds);
        result
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}
