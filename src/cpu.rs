//! CPU placement for producer, arbiter, and dispatcher threads.
//!
//! Pinning is advisory: a failure to set affinity is logged and ignored
//! rather than propagated, since the arbiter is still correct (just not
//! as fast) on a CPU set the scheduler chose for it.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;

/// Best-effort pin of the calling thread to `cpu`.
pub fn pin_current_thread(cpu: usize) {
    let mut set = CpuSet::new();
    if let Err(err) = set.set(cpu) {
        tracing::warn!(cpu, error = %err, "cpu index out of range for affinity mask");
        return;
    }
    if let Err(err) = sched_setaffinity(Pid::from_raw(0), &set) {
        tracing::warn!(cpu, error = %err, "failed to pin thread to cpu");
    }
}

static AVAILABLE_CPUS: OnceCell<usize> = OnceCell::new();

/// Number of CPUs visible to this process, used to size the per-CPU
/// client-queue table when the caller doesn't pick an explicit count.
///
/// Cached after the first call: the topology this process sees doesn't
/// change between calls, and callers like `build_client_queue_table` may
/// ask more than once per startup.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(num_cpus::get)
}
