//! The shaping-queue contract and the adapter that manages stealing it.

use std::collections::VecDeque;

use crate::item::PacketItem;

/// Result of offering an item to a shaping queue's own `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    Dropped,
}

/// The external traffic-shaping discipline the arbiter steals ownership
/// of for as long as it runs. Implementations are expected to have their
/// own internal queueing beyond what `ActiveDeviceQueue` tracks — that's
/// exactly the state `take_requeued`/`take_bad_transmit` exist to drain
/// when ownership changes hands.
pub trait ShapingQueue: Send {
    fn enqueue(&mut self, item: Box<dyn PacketItem>) -> EnqueueOutcome;

    /// Pulls the next item in the queue's own dequeue order, if any.
    fn dequeue(&mut self) -> Option<Box<dyn PacketItem>>;

    /// An item the queue is holding aside from a previous dequeue it
    /// could not fully dispose of (the kernel's `gso_skb`). Consulted
    /// before `dequeue` on every visit, and drained on steal.
    fn take_requeued(&mut self) -> Option<Box<dyn PacketItem>>;

    /// An item left over from a transmit the surrounding system couldn't
    /// complete before the arbiter took ownership. Drained on steal only.
    fn take_bad_transmit(&mut self) -> Option<Box<dyn PacketItem>>;

    /// Attempt to take exclusive ownership for the duration of a run.
    /// Returns `false` if some other scheduler currently owns it.
    fn try_begin_run(&mut self) -> bool;

    /// Release ownership back to the surrounding system.
    fn end_run(&mut self);
}

/// Ownership-stolen state of a shaping queue: `Unknown -> Stealing ->
/// Owned`, `Owned -> Released`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnershipState {
    Unknown,
    Owned,
    Released,
}

/// Wraps one external `ShapingQueue`, tracking steal state, the pacing
/// deadline `next_link_idle`, and the per-loop `batch_limit`.
pub struct ShapingQueueAdapter {
    queue: Box<dyn ShapingQueue>,
    state: OwnershipState,
    pub next_link_idle: u64,
    pub batch_limit: usize,
}

impl ShapingQueueAdapter {
    pub fn new(queue: Box<dyn ShapingQueue>, batch_limit: usize) -> Self {
        Self { queue, state: OwnershipState::Unknown, next_link_idle: 0, batch_limit }
    }

    pub fn is_owned(&self) -> bool {
        self.state == OwnershipState::Owned
    }

    /// Runs the steal-and-drain protocol on first sighting. Returns
    /// `false` if the steal itself failed (the caller drops the
    /// triggering item and retries next time this queue is sighted).
    pub fn steal_and_drain(&mut self, now: u64) -> bool {
        if !self.queue.try_begin_run() {
            return false;
        }
        while self.queue.dequeue().is_some() {}
        let _ = self.queue.take_requeued();
        let _ = self.queue.take_bad_transmit();
        self.state = OwnershipState::Owned;
        self.next_link_idle = now;
        true
    }

    pub fn enqueue(&mut self, item: Box<dyn PacketItem>) -> EnqueueOutcome {
        self.queue.enqueue(item)
    }

    pub fn take_next(&mut self) -> Option<Box<dyn PacketItem>> {
        self.queue.take_requeued().or_else(|| self.queue.dequeue())
    }

    pub fn release(&mut self) {
        if self.state == OwnershipState::Owned {
            self.queue.end_run();
        }
        self.state = OwnershipState::Released;
    }
}

/// Built-in bypass shaping queue (`tc_bypass = 1`): a plain bounded FIFO,
/// not a null-shaper. Items pushed through it still pace against
/// `next_link_idle` in the dequeue phase exactly like any device's own
/// shaping queue.
pub struct BypassFifoQueue {
    items: VecDeque<Box<dyn PacketItem>>,
    capacity: usize,
    requeued: Option<Box<dyn PacketItem>>,
    owned: bool,
}

impl BypassFifoQueue {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity, requeued: None, owned: false }
    }
}

impl ShapingQueue for BypassFifoQueue {
    fn enqueue(&mut self, item: Box<dyn PacketItem>) -> EnqueueOutcome {
        if self.items.len() >= self.capacity {
            return EnqueueOutcome::Dropped;
        }
        self.items.push_back(item);
        EnqueueOutcome::Accepted
    }

    fn dequeue(&mut self) -> Option<Box<dyn PacketItem>> {
        self.items.pop_front()
    }

    fn take_requeued(&mut self) -> Option<Box<dyn PacketItem>> {
        self.requeued.take()
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
