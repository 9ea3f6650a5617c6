//! Hand-driven simulation clock.

use meshrpc_core::SimTick;
use meshrpc_rpc::Clock;
use std::sync::Mutex;
use std::time::Duration;

/// [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    state: Mutex<(SimTick, Duration)>,
}

impl ManualClock {
    /// Clock at tick zero, time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Step one tick forward, `elapsed` later.
    pub fn step(&self, elapsed: Duration) -> SimTick {
        let Ok(mut state) = self.state.lock() else {
            return SimTick::ZERO;
        };
        state.0 = state.0.advance(1);
        state.1 += elapsed;
        state.0
    }

    /// Move time forward without changing the tick.
    pub fn advance_time(&self, elapsed: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.1 += elapsed;
        }
    }
}

impl Clock for ManualClock {
    fn current_tick(&self) -> SimTick {
        self.state.lock().map(|state| state.0).unwrap_or(SimTick::ZERO)
    }

    fn current_time(&self) -> Duration {
        self.state.lock().map(|state| state.1).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_moves_tick_and_time() {
        let clock = ManualClock::new();
        assert_eq!(clock.step(Duration::from_millis(50)), SimTick(1));
        clock.advance_time(Duration::from_millis(25));
        assert_eq!(clock.current_tick(), SimTick(1));
        assert_eq!(clock.current_time(), Duration::from_millis(75));
    }
}
