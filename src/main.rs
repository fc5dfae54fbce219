//! Demo binary: wires up simulated producers, a real arbiter loop, an
//! in-memory shaping queue plus device sink, and reports the same
//! statistics a production deployment would read off the control
//! surface.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pspat::{
    build_client_queue_table, Arbiter, ArbiterHandle, Clock, DeviceQueue, DeviceQueueId, MailboxConfig,
    MonotonicClock, PacketItem, PspatConfig, ShapingQueue, TransmitStatus, XmitMode,
};

/// A trivial always-accept shaping queue, standing in for a real qdisc.
struct DemoShapingQueue {
    pending: VecDeque<Box<dyn PacketItem>>,
    owned: bool,
}

impl DemoShapingQueue {
    fn new() -> Self {
        Self { pending: VecDeque::new(), owned: false }
    }
}

impl ShapingQueue for DemoShapingQueue {
    fn enqueue(&mut self, item: Box<dyn PacketItem>) -> pspat::EnqueueOutcome {
        self.pending.push_back(item);
        pspat::EnqueueOutcome::Accepted
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
        if self.owned {
            false
        } else {
            self.owned = true;
            true
        }
    }

    fn end_run(&mut self) {
        self.owned = false;
    }
}

/// A device sink that always accepts and just counts bytes transmitted.
struct DemoDevice {
    transmitted_bytes: Arc<AtomicU64>,
}

impl DeviceQueue for DemoDevice {
    fn try_transmit(
        &mut self,
        items: VecDeque<Box<dyn PacketItem>>,
    ) -> (VecDeque<Box<dyn PacketItem>>, TransmitStatus) {
        let bytes: u64 = items.iter().map(|item| item.len() as u64).sum();
        self.transmitted_bytes.fetch_add(bytes, Ordering::Relaxed);
        (VecDeque::new(), TransmitStatus::Complete)
    }
}

struct DemoItem {
    len: usize,
    queue: DeviceQueueId,
    origin_cpu: usize,
}

impl PacketItem for DemoItem {
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

const NUM_PRODUCERS: usize = 4;
const ITEM_LEN_BYTES: usize = 1500;
const RATE_BITS_PER_SEC: u64 = 10_000_000_000; // 10 Gbit/s simulated link
const RUN_DURATION: Duration = Duration::from_secs(2);

fn main() {
    tracing_subscriber_init();

    println!("PSPAT - Parallel Scheduler for Packet Arbitration Tasks");
    println!("========================================================");

    let config = PspatConfig::builder()
        .rate_bytes_per_sec(RATE_BITS_PER_SEC / 8)
        .arb_qdisc_batch(64)
        .dispatch_batch(256)
        .xmit_mode(XmitMode::Arbiter)
        .build()
        .expect("demo configuration is valid");

    let payload_config = MailboxConfig::new(config.mailbox.entries, config.mailbox.line_size).unwrap();
    let cli_config = payload_config;
    let enabled = config.enabled_flag();

    let (mut producers, client_queues) =
        build_client_queue_table(NUM_PRODUCERS, cli_config, payload_config, enabled.clone());

    let transmitted_bytes = Arc::new(AtomicU64::new(0));

    let mut shaping: HashMap<DeviceQueueId, Box<dyn ShapingQueue>> = HashMap::new();
    shaping.insert(DeviceQueueId(0), Box::new(DemoShapingQueue::new()));

    let mut devices: HashMap<DeviceQueueId, Box<dyn DeviceQueue>> = HashMap::new();
    devices.insert(DeviceQueueId(0), Box::new(DemoDevice { transmitted_bytes: transmitted_bytes.clone() }));

    let clock: Box<dyn Clock> = Box::new(MonotonicClock::new());
    let (mut arbiter, handle) =
        Arbiter::new(config, clock, client_queues, shaping, None, devices, None, enabled.clone());

    let stop = Arc::new(AtomicBool::new(false));
    let arbiter_stop = stop.clone();
    let arbiter_thread = std::thread::Builder::new()
        .name("pspat-arbiter".into())
        .spawn(move || {
            pspat::cpu::pin_current_thread(0);
            arbiter.run(&arbiter_stop);
        })
        .expect("spawn arbiter thread");

    let mut producer_threads = Vec::with_capacity(NUM_PRODUCERS);
    for (cpu, mut producer) in producers.drain(..).enumerate() {
        let producer_stop = stop.clone();
        producer_threads.push(
            std::thread::Builder::new()
                .name(format!("pspat-producer-{cpu}"))
                .spawn(move || {
                    pspat::cpu::pin_current_thread(cpu + 1);
                    let mut sent = 0u64;
                    while !producer_stop.load(Ordering::Relaxed) {
                        let item = Box::new(DemoItem { len: ITEM_LEN_BYTES, queue: DeviceQueueId(0), origin_cpu: cpu });
                        match producer.push(item) {
                            Ok(()) | Err(pspat::PspatError::MailboxFull) => {}
                            Err(other) => {
                                tracing::warn!(cpu, error = %other, "producer push failed");
                                break;
                            }
                        }
                        sent += 1;
                        if sent % 64 == 0 {
                            std::thread::yield_now();
                        }
                    }
                    producer.mark_dead();
                    sent
                })
                .expect("spawn producer thread"),
        );
    }

    std::thread::sleep(RUN_DURATION);
    stop.store(true, Ordering::Relaxed);

    let mut total_sent = 0u64;
    for thread in producer_threads {
        total_sent += thread.join().expect("producer thread panicked");
    }
    arbiter_thread.join().expect("arbiter thread panicked");

    print_report(&handle, total_sent, transmitted_bytes.load(Ordering::Relaxed));
}

fn print_report(handle: &Arc<ArbiterHandle>, total_sent: u64, transmitted_bytes: u64) {
    let stats = handle.metrics().snapshot();
    println!("\nRun summary ({RUN_DURATION:?} at simulated {} Gbit/s):", RATE_BITS_PER_SEC / 1_000_000_000);
    println!("  items submitted:   {total_sent}");
    println!("  bytes transmitted: {transmitted_bytes}");
    println!("  arbiter stats:     {stats}");
}

#[cfg(feature = "tracing-subscriber")]
fn tracing_subscriber_init() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
}

#[cfg(not(feature = "tracing-subscriber"))]
fn tracing_subscriber_init() {}
