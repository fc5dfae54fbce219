//! Per-producer-CPU client queues: the fan-in side of the arbiter.
//!
//! Each CPU gets a client-list mailbox (`MailboxHandle` tokens) split
//! once, at table construction, into a producer half kept by the
//! producer's own submit handle and a consumer half kept by the
//! arbiter's `ClientQueue`. The one piece of state that must cross
//! threads outside that mailbox is the freshly created payload
//! mailbox's consumer half itself, which the producer publishes into a
//! one-shot slot (`CpuSlotShared::pending_entry`) the arbiter drains the
//! first time it sees that generation's handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::item::{PacketHandle, PacketItem};
use crate::mailbox::{Mailbox, MailboxConfig, MailboxConsumer, MailboxHandle, MailboxProducer};

static IDENTIFIER_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_identifier() -> u64 {
    IDENTIFIER_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Fields shared between a producer and the arbiter for one payload
/// mailbox generation: `dead` is producer-write/arbiter-read,
/// `backpressure` is written by both but each side's write is
/// idempotent (arbiter sets on reject, producer clears on observe).
pub struct ProducerMailboxShared {
    pub identifier: u64,
    dead: AtomicBool,
    backpressure: AtomicBool,
}

impl ProducerMailboxShared {
    fn new(identifier: u64) -> Self {
        Self { identifier, dead: AtomicBool::new(false), backpressure: AtomicBool::new(false) }
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn set_backpressure(&self) {
        self.backpressure.store(true, Ordering::Release);
    }

    fn take_backpressure(&self) -> bool {
        self.backpressure.swap(false, Ordering::AcqRel)
    }
}

/// The arbiter's view of one producer's payload mailbox: shared
/// liveness/backpressure flags plus the consumer half of the mailbox
/// itself.
pub struct ProducerMailboxEntry {
    pub shared: Arc<ProducerMailboxShared>,
    consumer: MailboxConsumer<PacketHandle>,
}

impl ProducerMailboxEntry {
    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn extract(&self) -> Option<Box<dyn PacketItem>> {
        self.consumer.extract().map(PacketHandle::into_inner)
    }

    pub fn clear(&self) {
        self.consumer.clear();
    }
}

/// Per-producer-CPU drop counters, readable from either side of the
/// client queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerDropCounters {
    pub backpressure_drops: u64,
    pub input_queue_drops: u64,
}

struct CpuSlotShared {
    pending_entry: Mutex<Option<Arc<ProducerMailboxEntry>>>,
    /// Per-producer-CPU counters: pushes rejected because the arbiter
    /// had set `backpressure`, and pushes rejected because the payload
    /// mailbox itself was full. Kept on the slot rather than on
    /// `ProducerMailboxShared` so they survive across mailbox generations.
    backpressure_drops: AtomicU64,
    input_queue_drops: AtomicU64,
}

/// Producer-owned handle for submitting work from one pinned CPU.
///
/// Exactly one thread drives a given `ProducerSubmitHandle`: that's what
/// makes the underlying payload mailbox single-producer.
pub struct ProducerSubmitHandle {
    cpu: usize,
    mailbox_config: MailboxConfig,
    shared_slot: Arc<CpuSlotShared>,
    cli_list_producer: MailboxProducer<MailboxHandle>,
    current: Option<(Arc<ProducerMailboxShared>, MailboxProducer<PacketHandle>)>,
    cli_last_mb: Option<u64>,
    enabled: Arc<AtomicBool>,
}

impl ProducerSubmitHandle {
    /// Pushes one item, creating the payload mailbox on first use.
    ///
    /// Backpressure is checked and cleared before the insert, and the
    /// client-list mailbox is only re-announced when the payload
    /// mailbox's identifier changed since the last push (death + lazy
    /// rebirth).
    pub fn push(&mut self, item: Box<dyn PacketItem>) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(crate::error::PspatError::NotEnabled);
        }
        if self.current.is_none() {
            self.create_payload_mailbox();
        }
        let (shared, producer) = self.current.as_ref().expect("just created above");

        if shared.take_backpressure() {
            self.shared_slot.backpressure_drops.fetch_add(1, Ordering::Relaxed);
            return Err(crate::error::PspatError::MailboxFull);
        }

        if let Err(err) = producer.insert(PacketHandle::new(item)) {
            self.shared_slot.input_queue_drops.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        if self.cli_last_mb != Some(shared.identifier) {
            std::sync::atomic::fence(Ordering::SeqCst);
            let handle = MailboxHandle::new(shared.identifier, self.cpu as u64);
            self.cli_list_producer.insert(handle)?;
            self.cli_last_mb = Some(shared.identifier);
        }
        Ok(())
    }

    /// Snapshot of this producer's backpressure/input-queue drop counters.
    pub fn drop_counters(&self) -> ProducerDropCounters {
        ProducerDropCounters {
            backpressure_drops: self.shared_slot.backpressure_drops.load(Ordering::Relaxed),
            input_queue_drops: self.shared_slot.input_queue_drops.load(Ordering::Relaxed),
        }
    }

    /// Marks this producer's current payload mailbox generation dead.
    /// The arbiter frees it once it has observed it empty and no
    /// client-list activity anywhere in a round.
    pub fn mark_dead(&self) {
        if let Some((shared, _)) = &self.current {
            shared.mark_dead();
        }
    }

    fn create_payload_mailbox(&mut self) {
        let identifier = next_identifier();
        let shared = Arc::new(ProducerMailboxShared::new(identifier));
        let (producer, consumer) = Mailbox::new(self.mailbox_config).split();

        // Load-bearing: everything written into the fresh mailbox must
        // be visible before its handle reaches the arbiter.
        std::sync::atomic::fence(Ordering::SeqCst);
        *self.shared_slot.pending_entry.lock() =
            Some(Arc::new(ProducerMailboxEntry { shared: shared.clone(), consumer }));

        self.current = Some((shared, producer));
    }
}

/// Arbiter-owned per-producer-CPU record.
pub struct ClientQueue {
    shared_slot: Arc<CpuSlotShared>,
    cli_list_consumer: MailboxConsumer<MailboxHandle>,
    arb_extract_next: u64,
    arb_last_mb: Option<Arc<ProducerMailboxEntry>>,
    mb_to_clear: Vec<Arc<ProducerMailboxEntry>>,
}

impl ClientQueue {
    /// Returns the payload mailbox to drain this visit, per `get_payload_mb`:
    /// the cached `arb_last_mb` if it still has work, otherwise a fresh
    /// handle pulled from the client-list mailbox.
    pub fn get_payload_mb(&mut self) -> Option<Arc<ProducerMailboxEntry>> {
        if let Some(entry) = &self.arb_last_mb {
            if !entry.is_empty() {
                let entry = entry.clone();
                self.mb_to_clear.push(entry.clone());
                return Some(entry);
            }
        }

        self.cli_list_consumer.extract()?;
        let entry = self.shared_slot.pending_entry.lock().take()?;
        // Pairs with the producer's fence in `create_payload_mailbox`.
        std::sync::atomic::fence(Ordering::SeqCst);
        self.arb_last_mb = Some(entry.clone());
        self.mb_to_clear.push(entry.clone());
        Some(entry)
    }

    /// `clear()`s every mailbox visited this round, including the
    /// client-list mailbox itself (harmless no-op when nothing new was
    /// extracted from it).
    pub fn ack(&mut self) {
        for entry in self.mb_to_clear.drain(..) {
            entry.clear();
        }
        self.cli_list_consumer.clear();
    }

    pub fn should_visit(&self, now: u64) -> bool {
        now >= self.arb_extract_next
    }

    pub fn schedule_next_visit(&mut self, now: u64, interval_ns: u64) {
        self.arb_extract_next = now + interval_ns;
    }

    /// If the cached payload mailbox is dead and drained, detaches it
    /// for the caller to stage into the arbiter's deferred-delete list.
    pub fn take_deletable(&mut self) -> Option<Arc<ProducerMailboxEntry>> {
        let dead_and_empty = self
            .arb_last_mb
            .as_ref()
            .map(|entry| entry.shared.is_dead() && entry.is_empty())
            .unwrap_or(false);
        if dead_and_empty {
            self.arb_last_mb.take()
        } else {
            None
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !self.cli_list_consumer.is_empty()
            || self.arb_last_mb.as_ref().is_some_and(|entry| !entry.is_empty())
    }

    /// Reads this producer's backpressure/input-queue drop counters from
    /// the arbiter side, for control-surface reporting alongside the
    /// producer's own `ProducerSubmitHandle::drop_counters`.
    pub fn drop_counters(&self) -> ProducerDropCounters {
        ProducerDropCounters {
            backpressure_drops: self.shared_slot.backpressure_drops.load(Ordering::Relaxed),
            input_queue_drops: self.shared_slot.input_queue_drops.load(Ordering::Relaxed),
        }
    }

    /// Raises backpressure on the payload mailbox this client queue is
    /// currently caching, if any. Used by the arbiter on a shaping-queue
    /// enqueue reject or a dispatcher-mailbox-full event.
    pub fn mark_backpressure(&self) {
        if let Some(entry) = &self.arb_last_mb {
            entry.shared.set_backpressure();
        }
    }
}

/// Builds the producer-side and arbiter-side halves of the client-queue
/// table for `num_cpus` producer slots, in lockstep.
///
/// `enabled` is the shared `enable` control-surface flag: every producer
/// handle checks it on `push`, and the caller retains the `Arc` to flip
/// it alongside the arbiter's own registration state.
pub fn build_client_queue_table(
    num_cpus: usize,
    client_list_config: MailboxConfig,
    payload_config: MailboxConfig,
    enabled: Arc<AtomicBool>,
) -> (Vec<ProducerSubmitHandle>, Vec<ClientQueue>) {
    let mut producers = Vec::with_capacity(num_cpus);
    let mut queues = Vec::with_capacity(num_cpus);

    for cpu in 0..num_cpus {
        let (cli_producer, cli_consumer) = Mailbox::<MailboxHandle>::new(client_list_config).split();
        let shared_slot = Arc::new(CpuSlotShared {
            pending_entry: Mutex::new(None),
            backpressure_drops: AtomicU64::new(0),
            input_queue_drops: AtomicU64::new(0),
        });

        producers.push(ProducerSubmitHandle {
            cpu,
            mailbox_config: payload_config,
            shared_slot: shared_slot.clone(),
            cli_list_producer: cli_producer,
            current: None,
            cli_last_mb: None,
            enabled: enabled.clone(),
        });
        queues.push(ClientQueue {
            shared_slot,
            cli_list_consumer: cli_consumer,
            arb_extract_next: 0,
            arb_last_mb: None,
            mb_to_clear: Vec::new(),
        });
    }

    (producers, queues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::testing::FixedItem;

    fn small_config() -> MailboxConfig {
        MailboxConfig::new(64, 16).unwrap()
    }

    fn item(len: usize) -> Box<dyn PacketItem> {
        Box::new(FixedItem::new(len, 0, 0))
    }

    fn small_table() -> (Vec<ProducerSubmitHandle>, Vec<ClientQueue>) {
        build_client_queue_table(1, small_config(), small_config(), Arc::new(AtomicBool::new(true)))
    }

    #[test]
    fn push_then_drain_round_trip() {
        let (mut producers, mut queues) = small_table();
        producers[0].push(item(7)).unwrap();

        let mb = queues[0].get_payload_mb().expect("payload mailbox should exist");
        let got = mb.extract().expect("item should be present");
        assert_eq!(got.len(), 7);
        assert!(mb.is_empty());
        queues[0].ack();
    }

    #[test]
    fn cached_mailbox_is_reused_without_new_client_list_entry() {
        let (mut producers, mut queues) = small_table();
        producers[0].push(item(1)).unwrap();
        let first = queues[0].get_payload_mb().unwrap();
        first.extract();
        queues[0].ack();

        producers[0].push(item(2)).unwrap();
        // Same generation: no new client-list entry, arb_last_mb is reused.
        let second = queues[0].get_payload_mb().unwrap();
        assert_eq!(second.extract().unwrap().len(), 2);
    }

    #[test]
    fn dead_and_drained_mailbox_becomes_deletable() {
        let (mut producers, mut queues) = small_table();
        producers[0].push(item(1)).unwrap();
        let mb = queues[0].get_payload_mb().unwrap();
        mb.extract();
        producers[0].mark_dead();

        assert!(queues[0].take_deletable().is_some());
    }

    #[test]
    fn backpressure_fails_one_push_then_recovers() {
        let (mut producers, mut queues) = small_table();
        producers[0].push(item(1)).unwrap();
        let mb = queues[0].get_payload_mb().unwrap();
        mb.shared.set_backpressure();

        assert!(matches!(producers[0].push(item(2)), Err(crate::error::PspatError::MailboxFull)));
        assert!(producers[0].push(item(3)).is_ok());
    }

    #[test]
    fn drop_counters_track_backpressure_and_full_mailbox_rejections() {
        let (mut producers, mut queues) = small_table();
        producers[0].push(item(1)).unwrap();
        let mb = queues[0].get_payload_mb().unwrap();

        mb.shared.set_backpressure();
        assert!(producers[0].push(item(2)).is_err());
        assert_eq!(producers[0].drop_counters().backpressure_drops, 1);
        assert_eq!(producers[0].drop_counters().input_queue_drops, 0);

        // Drive the payload mailbox to full so the next push is rejected
        // for capacity rather than backpressure.
        while producers[0].push(item(1)).is_ok() {}
        let counters = producers[0].drop_counters();
        assert!(counters.input_queue_drops >= 1);

        // Both sides of the client queue see the same counters.
        assert_eq!(queues[0].drop_counters(), producers[0].drop_counters());
    }
}
