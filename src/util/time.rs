//! Time utilities for game simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime and monotonic timestamps
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Monotonic milliseconds since server start. Never goes backwards, unlike
/// wallclock time; the simulation accumulator and all timer deadlines use this.
pub fn monotonic_ms() -> u64 {
    SERVER_START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Tick rate configuration. Simulation and broadcast both run at 30 Hz.
pub const TICK_RATE: u32 = 30;
pub const FIXED_STEP_MS: f64 = 1000.0 / TICK_RATE as f64;
pub const FIXED_STEP_S: f64 = 1.0 / TICK_RATE as f64;

/// Frame-time clamp to avoid the accumulator spiral after a stall.
pub const MAX_FRAME_MS: u64 = 100;

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_step_matches_tick_rate() {
        assert!((FIXED_STEP_MS - 33.333).abs() < 0.01);
        assert!((FIXED_STEP_S * TICK_RATE as f64 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
