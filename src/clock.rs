//! Clock capability for time-dependent queue logic.
//!
//! Every component that needs "now" takes a [`Clock`] so that delayed jobs,
//! claim deadlines, and stale detection can be tested deterministically with
//! a [`MockClock`] instead of waiting for real time to pass.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Mock clock for controlling time in tests.
///
/// The clock starts at the current wall time and only moves when
/// [`advance`](MockClock::advance) is called, making delayed jobs, stale
/// deadlines, and schedule computations deterministic.
///
/// # Examples
///
/// ```rust
/// use millwork::clock::{Clock, MockClock};
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let before = clock.now_ms();
///
/// clock.advance(Duration::seconds(90));
///
/// assert_eq!(clock.now_ms() - before, 90_000);
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current time.
    pub fn new() -> Self {
        Self {
            current_time: Arc::new(Mutex::new(Utc::now())),
        }
    }

    /// Create a mock clock starting at a specific epoch-millisecond instant.
    pub fn at(epoch_ms: i64) -> Self {
        let time = DateTime::from_timestamp_millis(epoch_ms).unwrap_or_else(Utc::now);
        Self {
            current_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Advance the mock time by the given duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.current_time.lock().unwrap();
        *time += duration;
    }

    /// Advance the mock time by the given number of milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.advance(chrono::Duration::milliseconds(ms));
    }

    /// Set the mock time to a specific instant.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current_time.lock().unwrap() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.current_time.lock().unwrap().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::at(1_000_000);
        assert_eq!(clock.now_ms(), 1_000_000);

        clock.advance_ms(1_500);
        assert_eq!(clock.now_ms(), 1_001_500);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(clock.now_ms(), 1_003_500);
    }

    #[test]
    fn test_mock_clock_shared_across_clones() {
        let clock = MockClock::at(0);
        let other = clock.clone();

        clock.advance_ms(42);
        assert_eq!(other.now_ms(), 42);
    }
}
