//! Time sources for the metadata store.
//!
//! Entity timestamps and task-lease staleness are all derived from the
//! [`Clock`] carried on the call context. Production code uses
//! [`SystemClock`]; tests that need to cross the task timeout use
//! [`SimulatedClock`] and advance it manually.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// An epoch-millis time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current instant as epoch milliseconds.
    fn millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually-advanced clock for deterministic tests.
///
/// Starts at the given instant and only moves when [`advance`](Self::advance)
/// is called.
#[derive(Debug)]
pub struct SimulatedClock {
    current: Mutex<DateTime<Utc>>,
}

impl SimulatedClock {
    /// Creates a simulated clock starting at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Creates a simulated clock starting at the current wall-clock time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().expect("clock lock poisoned");
        *current += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("clock lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances() {
        let clock = SimulatedClock::starting_now();
        let before = clock.millis();
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.millis(), before + 90_000);
    }

    #[test]
    fn simulated_clock_is_frozen_between_advances() {
        let clock = SimulatedClock::starting_now();
        assert_eq!(clock.millis(), clock.millis());
    }
}
