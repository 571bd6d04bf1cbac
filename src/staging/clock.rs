//! Wall Clock Abstraction
//!
//! Staged filenames and object keys are derived from UTC wall-clock time.
//! Everything that needs "now" goes through [`Clock`] so the simulation
//! harness can pin and advance time explicitly.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of UTC wall-clock time
///
/// Implementations:
/// - `SystemClock`: real system time
/// - `SimulatedClock`: controlled virtual time for DST
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Nanoseconds since the Unix epoch
    fn now_nanos(&self) -> i64 {
        self.now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// Production clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    nanos: Arc<AtomicI64>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        SimulatedClock {
            nanos: Arc::new(AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0))),
        }
    }

    pub fn from_nanos(nanos: i64) -> Self {
        SimulatedClock {
            nanos: Arc::new(AtomicI64::new(nanos)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as i64, Ordering::SeqCst);
    }

    pub fn advance_nanos(&self, nanos: i64) {
        debug_assert!(nanos >= 0, "simulated time must not go backwards");
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn set(&self, time: DateTime<Utc>) {
        self.nanos
            .store(time.timestamp_nanos_opt().unwrap_or(0), Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let t1 = clock.now_nanos();
        std::thread::sleep(Duration::from_millis(2));
        let t2 = clock.now_nanos();
        assert!(t2 > t1, "Time should advance");
    }

    #[test]
    fn test_simulated_clock_deterministic() {
        let start = Utc.with_ymd_and_hms(2024, 3, 5, 7, 59, 59).unwrap();
        let clock = SimulatedClock::new(start);

        assert_eq!(clock.now(), clock.now(), "Time should not advance on its own");

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now().hour(), 8);

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_simulated_clock_shared() {
        let clock = SimulatedClock::from_nanos(0);
        let clock2 = clock.clone();

        clock.advance_nanos(100);
        assert_eq!(clock2.now_nanos(), 100, "Clones should share state");
    }
}
