//! Hybrid-logical clock used to stamp inconsistent reads.

use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use holo_batch::Timestamp;

fn system_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Monotonic HLC: wall time follows the physical clock, the logical
/// component breaks ties when it does not advance.
pub struct HybridClock {
    state: Mutex<Timestamp>,
    physical: fn() -> i64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::with_physical_clock(system_nanos)
    }

    /// Clock driven by `physical` (nanoseconds), for deterministic tests.
    pub fn with_physical_clock(physical: fn() -> i64) -> Self {
        Self {
            state: Mutex::new(Timestamp::ZERO),
            physical,
        }
    }

    pub fn now(&self) -> Timestamp {
        let physical = (self.physical)();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if physical > state.wall_time {
            *state = Timestamp::new(physical, 0);
        } else {
            state.logical += 1;
        }
        *state
    }

    /// Fold in a timestamp observed from another node so later readings
    /// never fall behind it.
    pub fn update(&self, ts: Timestamp) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.forward(ts);
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frozen() -> i64 {
        100
    }

    #[test]
    fn logical_ticks_when_physical_is_stuck() {
        let clock = HybridClock::with_physical_clock(frozen);
        assert_eq!(clock.now(), Timestamp::new(100, 0));
        assert_eq!(clock.now(), Timestamp::new(100, 1));
        assert_eq!(clock.now(), Timestamp::new(100, 2));
    }

    #[test]
    fn update_moves_clock_forward_only() {
        let clock = HybridClock::with_physical_clock(frozen);
        clock.update(Timestamp::new(500, 3));
        assert_eq!(clock.now(), Timestamp::new(500, 4));
        clock.update(Timestamp::new(10, 0));
        assert_eq!(clock.now(), Timestamp::new(500, 5));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = HybridClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b > a);
    }
}
