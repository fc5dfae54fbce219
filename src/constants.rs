//! PSPAT tuning constants.

/// Default number of slots in a payload or client-list mailbox (power of two).
pub const DEFAULT_MAILBOX_ENTRIES: usize = 512;

/// Default cache-line size in bytes, used to derive `line_entries`.
pub const DEFAULT_LINE_SIZE: usize = 64;

/// Default per-shaping-queue batch limit for the dequeue phase.
pub const DEFAULT_QDISC_BATCH_LIMIT: usize = 64;

/// Default dispatcher drain batch size.
pub const DEFAULT_DISPATCH_BATCH: usize = 256;

/// Default dispatcher inter-pass sleep, in microseconds.
pub const DEFAULT_DISPATCH_SLEEP_US: u64 = 50;

/// Default minimum spacing between arbiter visits to the same producer, in nanoseconds.
pub const DEFAULT_ARB_INTERVAL_NS: u64 = 0;

/// Rounds of loop statistics accumulated before the running average/max resets.
///
/// Mirrors the kernel's `PSPAT_ARB_STATS_LOOPS`.
pub const ARB_STATS_LOOPS: u64 = 4096;

/// Shift applied to nanosecond clock readings to obtain pseudo-picoseconds.
pub const PICO_SHIFT: u32 = 10;
