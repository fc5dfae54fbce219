//! Monotonic time for the arbiter's pacing phase.

use std::time::Instant;

/// A source of monotonic "now", abstracted so tests can drive the arbiter
/// with a fake clock instead of racing the wall clock.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// `Instant`-backed clock, relative to its own construction.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Converts a nanosecond reading into the arbiter's internal pacing unit.
///
/// The loop reasons about pacing in sub-nanosecond steps so that a link
/// rate of a few bytes per pseudo-picosecond doesn't collapse to zero
/// under integer division; see `picos_per_byte`.
pub fn nanos_to_picos(nanos: u64) -> u64 {
    nanos << crate::constants::PICO_SHIFT
}

pub fn picos_to_nanos(picos: u64) -> u64 {
    picos >> crate::constants::PICO_SHIFT
}

/// Pseudo-picoseconds required to transmit one byte at `rate_bytes_per_sec`.
///
/// Zero input means unpaced and is mapped to zero cost per byte; callers
/// check `rate_bytes_per_sec == 0` separately to skip pacing altogether.
pub fn picos_per_byte(rate_bytes_per_sec: u64) -> u64 {
    if rate_bytes_per_sec == 0 {
        return 0;
    }
    nanos_to_picos(1_000_000_000) / rate_bytes_per_sec
}
