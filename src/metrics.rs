//! Arbiter counters and loop-latency histogram.

use std::sync::atomic::{AtomicU64, Ordering};

use cpu_time::ThreadTime;
use hdrhistogram::Histogram;
use parking_lot::Mutex;

/// Rolling window accumulated between two statistics rollups: every
/// `ARB_STATS_LOOPS` loops, `avg_ns`, `max_ns` and `avg_reqs` are
/// recomputed from it and it is reset.
struct LoopWindow {
    latency_ns: Histogram<u64>,
    loops: u64,
    items: u64,
}

impl LoopWindow {
    fn new() -> Self {
        Self {
            latency_ns: Histogram::new_with_bounds(1, 10_000_000_000, 3).expect("valid histogram bounds"),
            loops: 0,
            items: 0,
        }
    }
}

/// Live counters updated by the arbiter and dispatcher loops.
///
/// All fields are independent `AtomicU64`s rather than one struct behind
/// a lock: every field is written by exactly one thread (the arbiter or
/// a single dispatcher), so there is no cross-field consistency to buy
/// with a lock, only the cost of one. Per-producer input-queue drop
/// counters (including backpressure-driven drops) live on
/// `CpuSlotShared` in `client_queue.rs` instead, since they're written
/// by the producer thread they belong to.
pub struct ArbiterMetrics {
    pub fetched: AtomicU64,
    pub enqueue_drops: AtomicU64,
    pub dequeued: AtomicU64,
    pub transmitted: AtomicU64,
    pub transmit_errors: AtomicU64,
    pub dispatch_drops: AtomicU64,
    pub shaping_reject_drops: AtomicU64,
    pub steal_conflicts: AtomicU64,
    pub loops: AtomicU64,
    window: Mutex<LoopWindow>,
    /// Latest rolled-over values, recomputed every `ARB_STATS_LOOPS`
    /// passes and held steady in between (not a live running average).
    avg_loop_ns: AtomicU64,
    max_loop_ns: AtomicU64,
    avg_reqs: AtomicU64,
    /// Thread CPU time at construction, used to report how much CPU the
    /// owning loop has burned rather than how much wall time has passed.
    cpu_start: ThreadTime,
}

impl ArbiterMetrics {
    pub fn new() -> Self {
        Self {
            fetched: AtomicU64::new(0),
            enqueue_drops: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            transmitted: AtomicU64::new(0),
            transmit_errors: AtomicU64::new(0),
            dispatch_drops: AtomicU64::new(0),
            shaping_reject_drops: AtomicU64::new(0),
            steal_conflicts: AtomicU64::new(0),
            loops: AtomicU64::new(0),
            window: Mutex::new(LoopWindow::new()),
            avg_loop_ns: AtomicU64::new(0),
            max_loop_ns: AtomicU64::new(0),
            avg_reqs: AtomicU64::new(0),
            cpu_start: ThreadTime::now(),
        }
    }

    /// CPU time the calling thread has spent since this `ArbiterMetrics`
    /// was built. Meaningful only when read from the thread that owns the
    /// loop (the arbiter or dispatcher thread), same as `ThreadTime` itself.
    pub fn cpu_time_us(&self) -> u64 {
        self.cpu_start.elapsed().as_micros() as u64
    }

    /// Folds one pass's latency and item count into the current window,
    /// rolling `avg_loop_ns`/`max_loop_ns`/`avg_reqs` over and resetting
    /// the window every `constants::ARB_STATS_LOOPS` passes.
    pub fn record_loop(&self, latency_ns: u64, items: u64) {
        let total_loops = self.loops.fetch_add(1, Ordering::Relaxed) + 1;
        let mut window = self.window.lock();
        let _ = window.latency_ns.record(latency_ns);
        window.loops += 1;
        window.items += items;

        if total_loops % crate::constants::ARB_STATS_LOOPS == 0 {
            self.avg_loop_ns.store(window.latency_ns.mean() as u64, Ordering::Relaxed);
            self.max_loop_ns.store(window.latency_ns.max(), Ordering::Relaxed);
            self.avg_reqs.store(window.items / window.loops.max(1), Ordering::Relaxed);
            window.latency_ns.reset();
            window.loops = 0;
            window.items = 0;
        }
    }

    pub fn record_fetch(&self, count: u64) {
        self.fetched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_enqueue_drop(&self) {
        self.enqueue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeue(&self, count: u64) {
        self.dequeued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_transmit(&self) {
        self.transmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transmit_batch(&self, count: u64) {
        self.transmitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_transmit_error(&self) {
        self.transmit_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_drop(&self) {
        self.dispatch_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shaping_reject(&self) {
        self.shaping_reject_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_steal_conflict(&self) {
        self.steal_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ArbiterStats {
        ArbiterStats {
            fetched: self.fetched.load(Ordering::Relaxed),
            enqueue_drops: self.enqueue_drops.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            transmit_errors: self.transmit_errors.load(Ordering::Relaxed),
            dispatch_drops: self.dispatch_drops.load(Ordering::Relaxed),
            shaping_reject_drops: self.shaping_reject_drops.load(Ordering::Relaxed),
            steal_conflicts: self.steal_conflicts.load(Ordering::Relaxed),
            loops: self.loops.load(Ordering::Relaxed),
            avg_loop_ns: self.avg_loop_ns.load(Ordering::Relaxed),
            max_loop_ns: self.max_loop_ns.load(Ordering::Relaxed),
            avg_reqs: self.avg_reqs.load(Ordering::Relaxed),
            cpu_time_us: self.cpu_time_us(),
        }
    }
}

impl Default for ArbiterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time rollup of `ArbiterMetrics`, taken every
/// `constants::ARB_STATS_LOOPS` passes of the arbiter loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArbiterStats {
    pub fetched: u64,
    pub enqueue_drops: u64,
    pub dequeued: u64,
    pub transmitted: u64,
    pub transmit_errors: u64,
    pub dispatch_drops: u64,
    pub shaping_reject_drops: u64,
    pub steal_conflicts: u64,
    pub loops: u64,
    pub avg_loop_ns: u64,
    pub max_loop_ns: u64,
    pub avg_reqs: u64,
    pub cpu_time_us: u64,
}

impl std::fmt::Display for ArbiterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "loops={} fetched={} dequeued={} tx={} tx_err={} enq_drop={} disp_drop={} \
             shape_drop={} steal_conflicts={} avg_loop_ns={} max_loop_ns={} \
             avg_reqs={} cpu_us={}",
            self.loops,
            self.fetched,
            self.dequeued,
            self.transmitted,
            self.transmit_errors,
            self.enqueue_drops,
            self.dispatch_drops,
            self.shaping_reject_drops,
            self.steal_conflicts,
            self.avg_loop_ns,
            self.max_loop_ns,
            self.avg_reqs,
            self.cpu_time_us,
        )
    }
}
