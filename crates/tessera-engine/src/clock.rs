//! Fixed-step clock.
//!
//! Turns variable wall-clock frame times into a whole number of fixed
//! simulation steps. The simulation itself never sees wall-clock time; it
//! only receives the resulting tick numbers.

use std::time::Duration;

use tracing::warn;

/// Accumulates elapsed time and pays it out in fixed steps.
#[derive(Debug, Clone)]
pub struct FixedStepClock {
    step: Duration,
    accumulator: Duration,
    max_steps_per_update: u32,
    steps_dropped: u64,
}

impl FixedStepClock {
    /// # Panics
    ///
    /// Panics if `fixed_dt` is not positive and finite, or if
    /// `max_steps_per_update` is zero.
    pub fn new(fixed_dt: f64, max_steps_per_update: u32) -> Self {
        assert!(
            fixed_dt > 0.0 && fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {fixed_dt}"
        );
        assert!(max_steps_per_update > 0, "max_steps_per_update must be non-zero");
        Self {
            step: Duration::from_secs_f64(fixed_dt),
            accumulator: Duration::ZERO,
            max_steps_per_update,
            steps_dropped: 0,
        }
    }

    /// Add `elapsed` and return how many fixed steps are now due.
    ///
    /// At most `max_steps_per_update` steps are paid out per call; whole
    /// steps beyond that are discarded so a long stall cannot snowball into
    /// ever longer catch-up frames.
    pub fn accumulate(&mut self, elapsed: Duration) -> u32 {
        self.accumulator += elapsed;
        let mut due = 0u32;
        while self.accumulator >= self.step && due < self.max_steps_per_update {
            self.accumulator -= self.step;
            due += 1;
        }
        if self.accumulator >= self.step {
            let behind = (self.accumulator.as_nanos() / self.step.as_nanos()) as u64;
            self.accumulator -= self.step * behind as u32;
            self.steps_dropped += behind;
            warn!(
                dropped = behind,
                max_steps = self.max_steps_per_update,
                "clock fell behind; dropping steps"
            );
        }
        due
    }

    /// Fraction of a step currently buffered, for render interpolation.
    pub fn alpha(&self) -> f64 {
        self.accumulator.as_secs_f64() / self.step.as_secs_f64()
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Total steps discarded by the catch-up limit.
    pub fn steps_dropped(&self) -> u64 {
        self.steps_dropped
    }
}
