//! The single-consumer arbiter loop: fans in from every client queue,
//! feeds shaping queues, paces dequeues against a simulated wire rate,
//! and emits to transmit or to a dispatcher mailbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client_queue::ClientQueue;
use crate::clock::{nanos_to_picos, picos_per_byte, Clock};
use crate::config::{PspatConfig, XmitMode};
use crate::device::{ActiveDeviceQueue, DeviceQueue, TransmitStatus};
use crate::error::Result;
use crate::item::{DeviceQueueId, PacketHandle, PacketItem};
use crate::mailbox::MailboxProducer;
use crate::metrics::ArbiterMetrics;
use crate::shaping::{EnqueueOutcome, ShapingQueueAdapter};

/// A message drained by the arbiter at the top of its own loop.
///
/// This is the only path by which external configuration changes reach
/// arbiter-owned state (e.g. `picos_per_byte`, which only the arbiter's
/// own thread ever writes, so no synchronization is needed to read it
/// back inside the loop).
#[derive(Debug, Clone, Copy)]
pub enum ArbiterCommand {
    SetRate(u64),
    SetEnabled(bool),
}

/// Outcome of one `Arbiter::run_once` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopOutcome {
    pub items_seen: usize,
    pub items_emitted: usize,
}

/// The process-wide published handle to a running arbiter: a thin
/// wrapper over the metrics snapshot and command channel, cheap enough
/// to hand out `Arc` clones to producers without either side blocking
/// on the arbiter's own loop.
pub struct ArbiterHandle {
    metrics: Arc<ArbiterMetrics>,
    commands: crossbeam_channel::Sender<ArbiterCommand>,
}

impl ArbiterHandle {
    pub fn metrics(&self) -> &ArbiterMetrics {
        &self.metrics
    }

    /// Queues a rate change for the arbiter to apply at the top of its
    /// next pass. Returns `false` if the arbiter has already shut down.
    pub fn set_rate(&self, rate_bytes_per_sec: u64) -> bool {
        self.commands.send(ArbiterCommand::SetRate(rate_bytes_per_sec)).is_ok()
    }

    /// Queues a toggle of the `enable` control-surface flag: disabling
    /// it gates arbiter participation, same as it gates producer
    /// submission on `ProducerSubmitHandle`. Returns `false` if the
    /// arbiter has already shut down.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.commands.send(ArbiterCommand::SetEnabled(enabled)).is_ok()
    }
}

static GLOBAL_ARBITER: Mutex<Option<Arc<ArbiterHandle>>> = Mutex::new(None);

/// Publishes the process-wide arbiter handle. Readers that already hold
/// a clone from before the swap keep it alive via the `Arc` refcount;
/// the old handle is only actually dropped once every such clone is
/// released: readers quiesce before free falls out of ordinary
/// reference counting, no epoch or quiescent-state tracking needed.
pub fn register(handle: Arc<ArbiterHandle>) {
    *GLOBAL_ARBITER.lock() = Some(handle);
}

pub fn current() -> Option<Arc<ArbiterHandle>> {
    GLOBAL_ARBITER.lock().clone()
}

pub fn unregister() {
    *GLOBAL_ARBITER.lock() = None;
}

/// Owns everything the arbiter loop touches: the client-queue table, the
/// shaping-queue adapters (per device queue, plus an optional bypass
/// queue), the active-device-queue list, and an optional dispatcher
/// mailbox for `XmitMode::Dispatch`.
pub struct Arbiter {
    config: PspatConfig,
    clock: Box<dyn Clock>,
    client_queues: Vec<ClientQueue>,
    owned_order: Vec<DeviceQueueId>,
    shaping_by_queue: HashMap<DeviceQueueId, ShapingQueueAdapter>,
    bypass: Option<ShapingQueueAdapter>,
    devices: HashMap<DeviceQueueId, ActiveDeviceQueue>,
    device_impls: HashMap<DeviceQueueId, Box<dyn DeviceQueue>>,
    active_device_queues: Vec<DeviceQueueId>,
    dispatcher_mailbox: Option<MailboxProducer<PacketHandle>>,
    mb_to_delete: Vec<Arc<crate::client_queue::ProducerMailboxEntry>>,
    metrics: Arc<ArbiterMetrics>,
    commands: crossbeam_channel::Receiver<ArbiterCommand>,
    picos_per_byte: u64,
    /// Shared `enable` control-surface flag. Gates arbiter participation
    /// the same way `ProducerSubmitHandle::push` gates submission
    /// against its own clone of this flag.
    enabled: Arc<AtomicBool>,
}

impl Arbiter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PspatConfig,
        clock: Box<dyn Clock>,
        client_queues: Vec<ClientQueue>,
        shaping_by_queue: HashMap<DeviceQueueId, Box<dyn crate::shaping::ShapingQueue>>,
        bypass_queue: Option<Box<dyn crate::shaping::ShapingQueue>>,
        device_impls: HashMap<DeviceQueueId, Box<dyn DeviceQueue>>,
        dispatcher_mailbox: Option<MailboxProducer<PacketHandle>>,
        enabled: Arc<AtomicBool>,
    ) -> (Self, Arc<ArbiterHandle>) {
        let metrics = Arc::new(ArbiterMetrics::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let picos_per_byte = picos_per_byte(config.rate_bytes_per_sec);

        let shaping_by_queue = shaping_by_queue
            .into_iter()
            .map(|(id, queue)| (id, ShapingQueueAdapter::new(queue, config.arb_qdisc_batch)))
            .collect();
        let bypass = bypass_queue.map(|q| ShapingQueueAdapter::new(q, config.arb_qdisc_batch));

        let arbiter = Self {
            config,
            clock,
            client_queues,
            owned_order: Vec::new(),
            shaping_by_queue,
            bypass,
            devices: HashMap::new(),
            device_impls,
            active_device_queues: Vec::new(),
            dispatcher_mailbox,
            mb_to_delete: Vec::new(),
            metrics: metrics.clone(),
            commands: rx,
            picos_per_byte,
            enabled,
        };
        let handle = Arc::new(ArbiterHandle { metrics, commands: tx });
        (arbiter, handle)
    }

    pub fn metrics(&self) -> &ArbiterMetrics {
        &self.metrics
    }

    /// Runs the voluntary-yield loop: the arbiter never blocks inside a
    /// pass, and between passes it yields to the scheduler whenever a
    /// pass produced no work, rather than busy-spinning. Releases every
    /// owned shaping queue back to the surrounding system before
    /// returning; see `shutdown`.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            let outcome = self.run_once();
            if outcome.items_seen == 0 {
                std::thread::yield_now();
            }
        }
        self.shutdown();
    }

    /// Releases every shaping queue currently owned by this arbiter back
    /// to the surrounding system, without freeing the queue itself
    /// (`spec.md` §4.C: "On shutdown, release ownership back to the
    /// system for each queue in the list; never free the queue itself").
    /// `run` calls this once its stop flag is observed; callers driving
    /// `run_once` directly (tests, a custom loop) should call it
    /// themselves before dropping the arbiter.
    pub fn shutdown(&mut self) {
        for adapter in self.shaping_by_queue.values_mut() {
            adapter.release();
        }
        if let Some(adapter) = self.bypass.as_mut() {
            adapter.release();
        }
    }

    fn resolve_queue_id(&self, item: &dyn PacketItem) -> DeviceQueueId {
        if self.config.single_txq {
            DeviceQueueId(0)
        } else {
            item.target_device_queue()
        }
    }

    /// Executes exactly one pass of the seven-step loop: time, fetch,
    /// ack, dequeue, emit (inside dequeue), flush, statistics.
    pub fn run_once(&mut self) -> LoopOutcome {
        let loop_start = self.clock.now_nanos();
        self.drain_commands();

        if !self.enabled.load(Ordering::Acquire) {
            return LoopOutcome::default();
        }

        // Step 1: time, rescaled to pseudo-picoseconds for pacing math.
        let now_nanos = loop_start;
        let now_picos = nanos_to_picos(now_nanos);

        let items_seen = self.fetch_phase(now_nanos, now_picos);

        // Step 3: ack phase.
        for queue in &mut self.client_queues {
            queue.ack();
        }
        if items_seen == 0 {
            self.mb_to_delete.clear();
        }

        // Step 4 + 5: dequeue/emit phases.
        let items_emitted = self.dequeue_and_emit(now_picos);

        // Step 6: flush (ARB mode only).
        if matches!(self.config.xmit_mode, XmitMode::Arbiter) {
            self.flush_active_devices();
        }

        // Step 7: statistics.
        let elapsed = self.clock.now_nanos().saturating_sub(loop_start);
        self.metrics.record_loop(elapsed, items_seen as u64);

        LoopOutcome { items_seen, items_emitted }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ArbiterCommand::SetRate(rate) => {
                    self.config.rate_bytes_per_sec = rate;
                    self.picos_per_byte = picos_per_byte(rate);
                }
                ArbiterCommand::SetEnabled(enabled) => {
                    self.enabled.store(enabled, Ordering::Release);
                }
            }
        }
    }

    fn fetch_phase(&mut self, now_nanos: u64, now_picos: u64) -> usize {
        let _span = tracing::trace_span!("fetch").entered();
        let mut items_seen = 0usize;

        for i in 0..self.client_queues.len() {
            if !self.client_queues[i].should_visit(now_nanos) {
                continue;
            }
            self.client_queues[i].schedule_next_visit(now_nanos, self.config.arb_interval_ns);

            while let Some(mb) = self.client_queues[i].get_payload_mb() {
                let Some(item) = mb.extract() else { break };
                items_seen += 1;
                self.metrics.record_fetch(1);

                let queue_id = self.resolve_queue_id(item.as_ref());
                match self.route_to_shaping_queue(queue_id, item, now_picos) {
                    RouteOutcome::Enqueued => {}
                    RouteOutcome::StealConflict => {
                        self.metrics.record_steal_conflict();
                        tracing::warn!(cpu = i, ?queue_id, "shaping queue steal conflict, dropping item");
                    }
                    RouteOutcome::Rejected => {
                        self.metrics.record_shaping_reject();
                        tracing::warn!(cpu = i, ?queue_id, "shaping queue rejected item, draining producer mailbox");
                        while mb.extract().is_some() {}
                        self.client_queues[i].mark_backpressure();
                    }
                }
            }

            if let Some(deletable) = self.client_queues[i].take_deletable() {
                self.mb_to_delete.push(deletable);
            }
        }

        items_seen
    }

    fn route_to_shaping_queue(
        &mut self,
        queue_id: DeviceQueueId,
        item: Box<dyn PacketItem>,
        now_picos: u64,
    ) -> RouteOutcome {
        let use_bypass = self.config.tc_bypass;
        let adapter =
            if use_bypass { self.bypass.as_mut() } else { self.shaping_by_queue.get_mut(&queue_id) };
        let Some(adapter) = adapter else {
            // No shaping queue registered for this device queue: treat
            // as a reject rather than silently accepting into nothing.
            return RouteOutcome::Rejected;
        };

        let mut newly_owned = false;
        if !adapter.is_owned() {
            if !adapter.steal_and_drain(now_picos) {
                return RouteOutcome::StealConflict;
            }
            newly_owned = true;
        }

        let outcome = match adapter.enqueue(item) {
            EnqueueOutcome::Accepted => RouteOutcome::Enqueued,
            EnqueueOutcome::Dropped => RouteOutcome::Rejected,
        };

        if newly_owned && !use_bypass && !self.owned_order.contains(&queue_id) {
            self.owned_order.push(queue_id);
        }
        outcome
    }

    fn dequeue_and_emit(&mut self, now_picos: u64) -> usize {
        let _span = tracing::trace_span!("dequeue").entered();
        let mut total_emitted = 0usize;

        if self.config.tc_bypass {
            if let Some(adapter) = self.bypass.take() {
                if adapter.is_owned() {
                    let (adapter, n) = self.drain_adapter(adapter, DeviceQueueId(0), now_picos);
                    total_emitted += n;
                    self.bypass = Some(adapter);
                } else {
                    self.bypass = Some(adapter);
                }
            }
        } else {
            let order = self.owned_order.clone();
            for queue_id in order {
                let Some(adapter) = self.shaping_by_queue.remove(&queue_id) else { continue };
                let (adapter, n) = self.drain_adapter(adapter, queue_id, now_picos);
                total_emitted += n;
                self.shaping_by_queue.insert(queue_id, adapter);
            }
        }

        self.metrics.record_dequeue(total_emitted as u64);
        total_emitted
    }

    /// Drains one shaping queue against its pacing deadline: takes items
    /// while the deadline has caught up to `now` and the per-loop batch
    /// limit hasn't been hit, and snaps the deadline back to `now` if
    /// the queue starved before either limit was reached, guarding
    /// against unbounded credit accumulation during idle periods.
    fn drain_adapter(
        &mut self,
        mut adapter: ShapingQueueAdapter,
        queue_id: DeviceQueueId,
        now_picos: u64,
    ) -> (ShapingQueueAdapter, usize) {
        let _span = tracing::trace_span!("emit").entered();
        let mut deadline = adapter.next_link_idle;
        let mut n = 0usize;
        let mut starved = false;

        while deadline <= now_picos && n < adapter.batch_limit {
            let Some(item) = adapter.take_next() else {
                starved = true;
                break;
            };
            deadline = deadline.saturating_add(self.picos_per_byte.saturating_mul(item.len() as u64));
            n += 1;
            self.emit(item, queue_id);
        }

        if starved {
            deadline = now_picos;
        }
        adapter.next_link_idle = deadline;
        (adapter, n)
    }

    fn emit(&mut self, item: Box<dyn PacketItem>, queue_id: DeviceQueueId) {
        match self.config.xmit_mode {
            XmitMode::Arbiter => {
                self.devices.entry(queue_id).or_insert_with(ActiveDeviceQueue::new).markq.push_back(item);
                if !self.active_device_queues.contains(&queue_id) {
                    self.active_device_queues.push(queue_id);
                }
            }
            XmitMode::Dispatch => {
                let origin_cpu = item.origin_cpu();
                let handle = PacketHandle::new(item);
                let accepted = match &self.dispatcher_mailbox {
                    Some(producer) => producer.insert(handle).is_ok(),
                    None => false,
                };
                if !accepted {
                    self.metrics.record_dispatch_drop();
                    tracing::warn!(cpu = origin_cpu, "dispatcher mailbox full, dropping item");
                    if let Some(queue) = self.client_queues.get(origin_cpu) {
                        queue.mark_backpressure();
                    }
                }
            }
            XmitMode::Drop => {}
        }
    }

    fn flush_active_devices(&mut self) {
        let _span = tracing::trace_span!("flush").entered();
        let active_ids = self.active_device_queues.clone();
        let mut still_active = Vec::with_capacity(active_ids.len());

        for queue_id in active_ids {
            let Some(device_impl) = self.device_impls.get_mut(&queue_id) else {
                continue;
            };
            let Some(active) = self.devices.get_mut(&queue_id) else {
                continue;
            };
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

enum RouteOutcome {
    Enqueued,
    StealConflict,
    Rejected,
}
