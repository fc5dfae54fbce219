//! Optional dispatcher task: drains a mailbox the arbiter filled in
//! `XmitMode::Dispatch`, groups items by target device queue, and runs
//! the same flush protocol as the arbiter's own ARB-mode flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::device::{ActiveDeviceQueue, DeviceQueue, TransmitStatus};
use crate::item::{DeviceQueueId, PacketHandle};
use crate::mailbox::MailboxConsumer;
use crate::metrics::ArbiterMetrics;
use std::sync::Arc;

/// Drains the dispatcher mailbox the arbiter's emit phase writes into,
/// groups items onto per-device `markq`/`validq` pairs exactly like the
/// arbiter's own flush, and transmits.
///
/// Unlike the arbiter, a `Dispatcher` owns no shaping queues: by the
/// time an item reaches its mailbox, shaping and pacing have already
/// happened. Its only job is the device-queue fan-out and the transmit
/// call itself, a much smaller slice of the work than the arbiter's own
/// loop.
pub struct Dispatcher {
    mailbox: MailboxConsumer<PacketHandle>,
    device_impls: HashMap<DeviceQueueId, Box<dyn DeviceQueue>>,
    devices: HashMap<DeviceQueueId, ActiveDeviceQueue>,
    active_device_queues: Vec<DeviceQueueId>,
    batch: usize,
    sleep_interval: Duration,
    metrics: Arc<ArbiterMetrics>,
}

impl Dispatcher {
    /// Builds a dispatcher with its own counters, kept separate from the
    /// arbiter's `ArbiterMetrics` instance so dispatch-side and
    /// arbiter-side dequeue counts stay distinguishable even though both
    /// sides happen to count through the same `dequeued` field.
    pub fn new(
        mailbox: MailboxConsumer<PacketHandle>,
        device_impls: HashMap<DeviceQueueId, Box<dyn DeviceQueue>>,
        batch: usize,
        sleep_us: u64,
    ) -> Self {
        Self {
            mailbox,
            device_impls,
            devices: HashMap::new(),
            active_device_queues: Vec::new(),
            batch,
            sleep_interval: Duration::from_micros(sleep_us),
            metrics: Arc::new(ArbiterMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &ArbiterMetrics {
        &self.metrics
    }

    /// Runs until `stop` is set, sleeping `sleep_us` between drains via
    /// best-effort `thread::sleep`. The sleep is checked against `stop`
    /// up front so shutdown latency is bounded by one interval rather
    /// than blocked on it.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            let drained = self.run_once();
            if drained == 0 && !stop.load(Ordering::Relaxed) {
                std::thread::sleep(self.sleep_interval);
            }
        }
        // Final drain so nothing already in the mailbox is silently lost.
        while self.run_once() > 0 {}
    }

    /// Drains up to `dispatch_batch` items and flushes every device with
    /// buffered work in one pass. Exposed separately from `run` so tests
    /// can drive it without a background thread, mirroring
    /// `Arbiter::run_once`.
    pub fn run_once(&mut self) -> usize {
        let drained = self.drain_once();
        self.flush_active_devices();
        drained
    }

    /// Drains up to `dispatch_batch` items from the mailbox onto the
    /// per-device `markq` lists.
    fn drain_once(&mut self) -> usize {
        let _span = tracing::trace_span!("dispatch_drain").entered();
        let mut drained = 0usize;
        while drained < self.batch {
            let Some(handle) = self.mailbox.extract() else { break };
            let item = handle.into_inner();
            drained += 1;
            let queue_id = item.target_device_queue();
            self.devices.entry(queue_id).or_insert_with(ActiveDeviceQueue::new).markq.push_back(item);
            if !self.active_device_queues.contains(&queue_id) {
                self.active_device_queues.push(queue_id);
            }
        }
        if drained > 0 {
            self.mailbox.clear();
            self.metrics.record_dequeue(drained as u64);
        }
        drained
    }

    /// Flushes every device queue with buffered work, exactly like the
    /// arbiter's ARB-mode flush: a device that comes back `Busy` keeps
    /// its leftovers on `validq` and stays on the active list.
    fn flush_active_devices(&mut self) {
        let _span = tracing::trace_span!("dispatch_flush").entered();
        let active_ids = self.active_device_queues.clone();
        let mut still_active = Vec::with_capacity(active_ids.len());

        for queue_id in active_ids {
            let Some(device_impl) = self.device_impls.get_mut(&queue_id) else { continue };
            let Some(active) = self.devices.get_mut(&queue_id) else { continue };
            let attempted = active.markq.len() + active.validq.len();
            let status = active.flush(device_impl.as_mut());
            let remaining = active.validq.len();
            let transmitted = attempted.saturating_sub(remaining);

            match status {
                TransmitStatus::Complete | TransmitStatus::Busy => {
                    self.metrics.record_transmit_batch(transmitted as u64);
                }
                TransmitStatus::Error => {
                    self.metrics.record_transmit_error();
                }
            }

            if !active.is_idle() {
                still_active.push(queue_id);
            }
        }

        self.active_device_queues = still_active;
    }
}
