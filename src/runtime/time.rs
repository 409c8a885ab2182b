use serde::{Deserialize, Serialize};

pub const TICKS_PER_SECOND: u64 = 6000;
/// Ticks between mains zero crossings (120 per second).
pub const TICKS_PER_ZERO_CROSS: u64 = 50;

/// Simulated machine clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemTime {
    ticks: u64,
}

impl SystemTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.ticks = 0;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn add_ticks(&mut self, ticks: u64) {
        self.ticks += ticks;
    }

    pub fn add_seconds(&mut self, seconds: f64) {
        self.ticks += (seconds * TICKS_PER_SECOND as f64).round().max(0.0) as u64;
    }

    pub fn seconds(&self) -> f64 {
        self.ticks as f64 / TICKS_PER_SECOND as f64
    }

    /// Advances to the next zero crossing; a no-op when already on one.
    pub fn wait_for_zero_cross(&mut self) {
        self.ticks = self.ticks.div_ceil(TICKS_PER_ZERO_CROSS) * TICKS_PER_ZERO_CROSS;
    }
}
