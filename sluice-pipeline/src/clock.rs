use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Source of wall-clock time for windows and default timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Useful to simulate clock jumps and late arrivals.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    /// Creates a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    /// Creates a clock frozen at the given Unix timestamp in seconds.
    pub fn from_secs(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    /// Moves the clock to `now`, which may lie in the past.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock() = now;
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.0.lock();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// A wall clock that advances with the Tokio timer.
///
/// It starts at a fixed time and moves with [`tokio::time::Instant`], so tests with a paused
/// runtime control wall time through `tokio::time::advance`.
#[derive(Debug)]
pub struct TokioClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl TokioClock {
    /// Creates a clock that reads `base` now.
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.started.elapsed()).unwrap_or(TimeDelta::MAX);
        self.base
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::from_secs(100);
        assert_eq!(clock.now().timestamp(), 100);

        clock.advance(TimeDelta::seconds(5));
        assert_eq!(clock.now().timestamp(), 105);

        clock.set(DateTime::from_timestamp(3, 0).unwrap());
        assert_eq!(clock.now().timestamp(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock() {
        let clock = TokioClock::new(DateTime::from_timestamp(100, 0).unwrap());
        tokio::time::advance(std::time::Duration::from_millis(2500)).await;
        assert_eq!(clock.now().timestamp_millis(), 102_500);
    }
}
