//! Integration tests for six end-to-end scenarios — steady-state drain,
//! overflow burst, shaping-queue reject, steal conflict, producer
//! death, and dispatch mode — driven entirely through the public API
//! (`Arbiter`, `ClientQueue` table, `ShapingQueue`/`DeviceQueue` test
//! doubles) with `N=512, line_entries=16, batch_limit=40`. Timing-
//! sensitive scenarios (steady-state drain and the rate-conformance
//! property) use the real monotonic clock with generous pass budgets
//! rather than a fake clock, since wall-clock progression is what the
//! arbiter actually paces against in production.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use pspat::item::PacketHandle;
use pspat::{
    build_client_queue_table, Arbiter, DeviceQueue, DeviceQueueId, Dispatcher, EnqueueOutcome, Mailbox,
    MailboxConfig, MonotonicClock, PacketItem, PspatConfig, PspatError, ShapingQueue, TransmitStatus,
    XmitMode,
};

const N: usize = 512;
const LINE_SIZE: usize = 128; // 16 entries * 8 bytes
const LINE_ENTRIES: usize = 16;
const BATCH_LIMIT: usize = 40;

struct ScenarioItem {
    len: usize,
    queue: DeviceQueueId,
    origin_cpu: usize,
}

impl ScenarioItem {
    fn new(len: usize) -> Box<dyn PacketItem> {
        Box::new(Self { len, queue: DeviceQueueId(0), origin_cpu: 0 })
    }
}

impl PacketItem for ScenarioItem {
    fn len(&self) -> usize {
        self.len
    }
    fn target_device_queue(&self) -> DeviceQueueId {
        self.queue
    }
    fn origin_cpu(&self) -> usize {
        self.origin_cpu
    }
}

/// Accepts everything; used where the scenario is about the mailbox or
/// the arbiter loop, not about shaping-queue rejection.
struct AcceptAllShaping {
    pending: VecDeque<Box<dyn PacketItem>>,
}

impl AcceptAllShaping {
    fn new() -> Self {
        Self { pending: VecDeque::new() }
    }
}

impl ShapingQueue for AcceptAllShaping {
    fn enqueue(&mut self, item: Box<dyn PacketItem>) -> EnqueueOutcome {
        self.pending.push_back(item);
        EnqueueOutcome::Accepted
    }
    fn dequeue(&mut self) -> Option<Box<dyn PacketItem>> {
        self.pending.pop_front()
    }
    fn take_requeued(&mut self) -> Option<Box<dyn PacketItem>> {
        None
    }
    fn take_bad_transmit(&mut self) -> Option<Box<dyn PacketItem>> {
        None
    }
    fn try_begin_run(&mut self) -> bool {
        true
    }
    fn end_run(&mut self) {}
}

/// Rejects anything longer than `max_len`; models scenario 3.
struct LengthLimitedShaping {
    max_len: usize,
    pending: VecDeque<Box<dyn PacketItem>>,
}

impl ShapingQueue for LengthLimitedShaping {
    fn enqueue(&mut self, item: Box<dyn PacketItem>) -> EnqueueOutcome {
        if item.len() > self.max_len {
            return EnqueueOutcome::Dropped;
        }
        self.pending.push_back(item);
        EnqueueOutcome::Accepted
    }
    fn dequeue(&mut self) -> Option<Box<dyn PacketItem>> {
        self.pending.pop_front()
    }
    fn take_requeued(&mut self) -> Option<Box<dyn PacketItem>> {
        None
    }
    fn take_bad_transmit(&mut self) -> Option<Box<dyn PacketItem>> {
        None
    }
    fn try_begin_run(&mut self) -> bool {
        true
    }
    fn end_run(&mut self) {}
}

/// `try_begin_run` fails exactly once, then always succeeds. Models
/// scenario 4.
struct FlakyShaping {
    attempts: u32,
    pending: VecDeque<Box<dyn PacketItem>>,
}

impl ShapingQueue for FlakyShaping {
    fn enqueue(&mut self, item: Box<dyn PacketItem>) -> EnqueueOutcome {
        self.pending.push_back(item);
        EnqueueOutcome::Accepted
    }
    fn dequeue(&mut self) -> Option<Box<dyn PacketItem>> {
        self.pending.pop_front()
    }
    fn take_requeued(&mut self) -> Option<Box<dyn PacketItem>> {
        None
    }
    fn take_bad_transmit(&mut self) -> Option<Box<dyn PacketItem>> {
        None
    }
    fn try_begin_run(&mut self) -> bool {
        self.attempts += 1;
        self.attempts > 1
    }
    fn end_run(&mut self) {}
}

struct CountingDevice {
    received: Arc<AtomicUsize>,
}

impl DeviceQueue for CountingDevice {
    fn try_transmit(
        &mut self,
        items: VecDeque<Box<dyn PacketItem>>,
    ) -> (VecDeque<Box<dyn PacketItem>>, TransmitStatus) {
        self.received.fetch_add(items.len(), Ordering::Relaxed);
        (VecDeque::new(), TransmitStatus::Complete)
    }
}

fn scenario_mailbox_config() -> MailboxConfig {
    MailboxConfig::new(N, LINE_SIZE).unwrap()
}

/// Scenario 1: steady-state drain. 1000 items of 1500 bytes offered at
/// 10 Gbit/s against a configured 40 Gbit/s link; expect all 1000
/// transmitted with zero shaping-queue drops.
#[test]
fn steady_state_drain_transmits_everything_without_drops() {
    let enabled = Arc::new(AtomicBool::new(true));
    let (mut producers, client_queues) =
        build_client_queue_table(1, scenario_mailbox_config(), scenario_mailbox_config(), enabled);

    let config = PspatConfig::builder()
        .rate_bytes_per_sec(40_000_000_000 / 8)
        .arb_qdisc_batch(BATCH_LIMIT)
        .arb_interval_ns(1000)
        .mailbox_entries(N)
        .mailbox_line_size(LINE_SIZE)
        .build()
        .unwrap();

    let mut shaping: HashMap<DeviceQueueId, Box<dyn ShapingQueue>> = HashMap::new();
    shaping.insert(DeviceQueueId(0), Box::new(AcceptAllShaping::new()));

    let received = Arc::new(AtomicUsize::new(0));
    let mut devices: HashMap<DeviceQueueId, Box<dyn DeviceQueue>> = HashMap::new();
    devices.insert(DeviceQueueId(0), Box::new(CountingDevice { received: received.clone() }));

    let (mut arbiter, handle) =
        Arbiter::new(config, Box::new(MonotonicClock::new()), client_queues, shaping, None, devices, None, Arc::new(AtomicBool::new(true)));

    const TOTAL_ITEMS: usize = 1000;
    let mut pushed = 0usize;
    let mut passes = 0usize;
    while pushed < TOTAL_ITEMS || received.load(Ordering::Relaxed) < TOTAL_ITEMS {
        if pushed < TOTAL_ITEMS {
            match producers[0].push(ScenarioItem::new(1500)) {
                Ok(()) => pushed += 1,
                Err(PspatError::MailboxFull) => {}
                Err(other) => panic!("unexpected push error: {other}"),
            }
        }
        arbiter.run_once();
        passes += 1;
        assert!(passes < 200_000, "steady-state drain did not converge in a bounded number of passes");
    }

    assert_eq!(received.load(Ordering::Relaxed), TOTAL_ITEMS);
    assert_eq!(handle.metrics().snapshot().enqueue_drops, 0);
}

/// Scenario 2: a 2N-item burst fills the mailbox to `N - line_entries`
/// and rejects the remainder with `Full`; the arbiter then drains every
/// accepted item without dropping any of them.
#[test]
fn overflow_burst_rejects_remainder_then_drains_cleanly() {
    let enabled = Arc::new(AtomicBool::new(true));
    let (mut producers, client_queues) =
        build_client_queue_table(1, scenario_mailbox_config(), scenario_mailbox_config(), enabled);

    let config = PspatConfig::builder()
        .rate_bytes_per_sec(0)
        .arb_qdisc_batch(BATCH_LIMIT)
        .arb_interval_ns(0)
        .mailbox_entries(N)
        .mailbox_line_size(LINE_SIZE)
        .build()
        .unwrap();

    let mut shaping: HashMap<DeviceQueueId, Box<dyn ShapingQueue>> = HashMap::new();
    shaping.insert(DeviceQueueId(0), Box::new(AcceptAllShaping::new()));

    let received = Arc::new(AtomicUsize::new(0));
    let mut devices: HashMap<DeviceQueueId, Box<dyn DeviceQueue>> = HashMap::new();
    devices.insert(DeviceQueueId(0), Box::new(CountingDevice { received: received.clone() }));

    let (mut arbiter, handle) =
        Arbiter::new(config, Box::new(MonotonicClock::new()), client_queues, shaping, None, devices, None, Arc::new(AtomicBool::new(true)));

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for _ in 0..(2 * N) {
        match producers[0].push(ScenarioItem::new(64)) {
            Ok(()) => accepted += 1,
            Err(PspatError::MailboxFull) => rejected += 1,
            Err(other) => panic!("unexpected push error: {other}"),
        }
    }

    assert_eq!(accepted, N - LINE_ENTRIES);
    assert_eq!(rejected, 2 * N - (N - LINE_ENTRIES));

    for _ in 0..((accepted / BATCH_LIMIT) + 2) {
        arbiter.run_once();
    }

    assert_eq!(received.load(Ordering::Relaxed), accepted);
    assert_eq!(handle.metrics().snapshot().enqueue_drops, 0);
}

/// Scenario 3: a shaping queue rejecting items over 600 bytes causes one
/// enqueue-drop and sets backpressure, which fails exactly the next
/// push before the producer recovers.
#[test]
fn shaping_reject_sets_backpressure_for_exactly_one_push() {
    let enabled = Arc::new(AtomicBool::new(true));
    let (mut producers, client_queues) =
        build_client_queue_table(1, scenario_mailbox_config(), scenario_mailbox_config(), enabled);

    let config = PspatConfig::builder()
        .rate_bytes_per_sec(0)
        .arb_qdisc_batch(BATCH_LIMIT)
        .arb_interval_ns(0)
        .mailbox_entries(N)
        .mailbox_line_size(LINE_SIZE)
        .build()
        .unwrap();

    let mut shaping: HashMap<DeviceQueueId, Box<dyn ShapingQueue>> = HashMap::new();
    shaping.insert(DeviceQueueId(0), Box::new(LengthLimitedShaping { max_len: 600, pending: VecDeque::new() }));

    let received = Arc::new(AtomicUsize::new(0));
    let mut devices: HashMap<DeviceQueueId, Box<dyn DeviceQueue>> = HashMap::new();
    devices.insert(DeviceQueueId(0), Box::new(CountingDevice { received: received.clone() }));

    let (mut arbiter, handle) =
        Arbiter::new(config, Box::new(MonotonicClock::new()), client_queues, shaping, None, devices, None, Arc::new(AtomicBool::new(true)));

    producers[0].push(ScenarioItem::new(500)).expect("500-byte item accepted by mailbox");
    producers[0].push(ScenarioItem::new(1500)).expect("1500-byte item accepted by mailbox");
    arbiter.run_once();

    assert_eq!(handle.metrics().snapshot().shaping_reject_drops, 1);

    let next_push = producers[0].push(ScenarioItem::new(500));
    assert!(matches!(next_push, Err(PspatError::MailboxFull)), "backpressure must fail exactly the next push");

    let recovered_push = producers[0].push(ScenarioItem::new(500));
    assert!(recovered_push.is_ok(), "backpressure clears after being observed once");
}

/// Scenario 4: the first sighting of a shaping queue drops its item when
/// the steal fails; the second sighting succeeds and enqueues normally.
#[test]
fn steal_conflict_drops_only_the_first_sighted_item() {
    let enabled = Arc::new(AtomicBool::new(true));
    let (mut producers, client_queues) =
        build_client_queue_table(1, scenario_mailbox_config(), scenario_mailbox_config(), enabled);

    let config = PspatConfig::builder()
        .rate_bytes_per_sec(0)
        .arb_qdisc_batch(BATCH_LIMIT)
        .arb_interval_ns(0)
        .mailbox_entries(N)
        .mailbox_line_size(LINE_SIZE)
        .build()
        .unwrap();

    let mut shaping: HashMap<DeviceQueueId, Box<dyn ShapingQueue>> = HashMap::new();
    shaping.insert(DeviceQueueId(0), Box::new(FlakyShaping { attempts: 0, pending: VecDeque::new() }));

    let received = Arc::new(AtomicUsize::new(0));
    let mut devices: HashMap<DeviceQueueId, Box<dyn DeviceQueue>> = HashMap::new();
    devices.insert(DeviceQueueId(0), Box::new(CountingDevice { received: received.clone() }));

    let (mut arbiter, handle) =
        Arbiter::new(config, Box::new(MonotonicClock::new()), client_queues, shaping, None, devices, None, Arc::new(AtomicBool::new(true)));

    producers[0].push(ScenarioItem::new(64)).unwrap();
    producers[0].push(ScenarioItem::new(64)).unwrap();
    producers[0].push(ScenarioItem::new(64)).unwrap();

    arbiter.run_once();
    arbiter.run_once();

    assert_eq!(handle.metrics().snapshot().steal_conflicts, 1);
    assert_eq!(received.load(Ordering::Relaxed), 2);
}

/// Scenario 5: a producer that submits 5 items and then marks itself
/// dead is fully drained, and the arbiter does not panic or lose track
/// of state across the round with no further client-list activity that
/// frees it.
#[test]
fn producer_death_drains_cleanly_and_arbiter_keeps_running() {
    let enabled = Arc::new(AtomicBool::new(true));
    let (mut producers, client_queues) =
        build_client_queue_table(1, scenario_mailbox_config(), scenario_mailbox_config(), enabled);

    let config = PspatConfig::builder()
        .rate_bytes_per_sec(0)
        .arb_qdisc_batch(BATCH_LIMIT)
        .arb_interval_ns(0)
        .mailbox_entries(N)
        .mailbox_line_size(LINE_SIZE)
        .build()
        .unwrap();

    let mut shaping: HashMap<DeviceQueueId, Box<dyn ShapingQueue>> = HashMap::new();
    shaping.insert(DeviceQueueId(0), Box::new(AcceptAllShaping::new()));

    let received = Arc::new(AtomicUsize::new(0));
    let mut devices: HashMap<DeviceQueueId, Box<dyn DeviceQueue>> = HashMap::new();
    devices.insert(DeviceQueueId(0), Box::new(CountingDevice { received: received.clone() }));

    let (mut arbiter, handle) =
        Arbiter::new(config, Box::new(MonotonicClock::new()), client_queues, shaping, None, devices, None, Arc::new(AtomicBool::new(true)));

    for _ in 0..5 {
        producers[0].push(ScenarioItem::new(64)).unwrap();
    }
    producers[0].mark_dead();

    // First pass drains the 5 items and observes the mailbox empty+dead.
    let first = arbiter.run_once();
    assert_eq!(first.items_seen, 5);

    // A subsequent quiet round (no client-list activity anywhere) is
    // where the deferred-delete candidates would be freed; this must not
    // panic even though the producer is gone.
    for _ in 0..3 {
        let outcome = arbiter.run_once();
        assert_eq!(outcome.items_seen, 0);
    }

    assert_eq!(received.load(Ordering::Relaxed), 5);
    assert_eq!(handle.metrics().snapshot().fetched, 5);
}

/// Scenario 6: in `DISPATCH` mode, the arbiter hands items to the
/// dispatcher's mailbox instead of transmitting them itself; the
/// dispatcher drains and transmits them, and the drop counters on both
/// sides stay at zero.
#[test]
fn dispatch_mode_fans_items_out_through_the_dispatcher() {
    let enabled = Arc::new(AtomicBool::new(true));
    let (mut producers, client_queues) =
        build_client_queue_table(1, scenario_mailbox_config(), scenario_mailbox_config(), enabled);

    let dispatch_mailbox_config = MailboxConfig::new(256, 64).unwrap();
    let (dispatch_producer, dispatch_consumer) =
        Mailbox::<PacketHandle>::new(dispatch_mailbox_config).split();

    let config = PspatConfig::builder()
        .xmit_mode(XmitMode::Dispatch)
        .rate_bytes_per_sec(0)
        .arb_qdisc_batch(BATCH_LIMIT)
        .arb_interval_ns(0)
        .dispatch_batch(256)
        .mailbox_entries(N)
        .mailbox_line_size(LINE_SIZE)
        .build()
        .unwrap();

    let mut shaping: HashMap<DeviceQueueId, Box<dyn ShapingQueue>> = HashMap::new();
    shaping.insert(DeviceQueueId(0), Box::new(AcceptAllShaping::new()));

    let (mut arbiter, arb_handle) = Arbiter::new(
        config,
        Box::new(MonotonicClock::new()),
        client_queues,
        shaping,
        None,
        HashMap::new(),
        Some(dispatch_producer),
        Arc::new(AtomicBool::new(true)),
    );

    let received = Arc::new(AtomicUsize::new(0));
    let mut dispatch_devices: HashMap<DeviceQueueId, Box<dyn DeviceQueue>> = HashMap::new();
    dispatch_devices.insert(DeviceQueueId(0), Box::new(CountingDevice { received: received.clone() }));
    let mut dispatcher = Dispatcher::new(dispatch_consumer, dispatch_devices, 256, 50);

    const TOTAL_ITEMS: usize = 100;
    for _ in 0..TOTAL_ITEMS {
        producers[0].push(ScenarioItem::new(64)).unwrap();
    }

    let mut total_drained = 0usize;
    for _ in 0..(TOTAL_ITEMS / BATCH_LIMIT + 2) {
        arbiter.run_once();
        total_drained += dispatcher.run_once();
    }

    assert_eq!(arb_handle.metrics().snapshot().dequeued, TOTAL_ITEMS as u64);
    assert_eq!(total_drained, TOTAL_ITEMS);
    assert_eq!(received.load(Ordering::Relaxed), TOTAL_ITEMS);
    assert_eq!(arb_handle.metrics().snapshot().dispatch_drops, 0);
}
