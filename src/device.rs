//! The device-transmit contract the flush phase drives.

use std::collections::VecDeque;

use crate::item::PacketItem;

/// Outcome of one `try_transmit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    /// Every item handed in was accepted.
    Complete,
    /// The device accepted a prefix (possibly empty) and is now busy;
    /// the rest is handed back for a later flush.
    Busy,
    Error,
}

/// An external device transmit path, addressed by `DeviceQueueId`.
///
/// The core owns buffering (`markq`/`validq`, see `ActiveDeviceQueue`) and
/// only calls `try_transmit` with the batch it wants sent.
pub trait DeviceQueue: Send {
    /// Consumes as many items as the device will currently accept and
    /// returns whatever is left, along with the resulting status.
    fn try_transmit(
        &mut self,
        items: VecDeque<Box<dyn PacketItem>>,
    ) -> (VecDeque<Box<dyn PacketItem>>, TransmitStatus);
}

/// Per-device buffering the arbiter's flush phase maintains: `markq` is
/// freshly emitted items waiting for a flush pass, `validq` is the
/// remainder a busy device handed back last time.
pub struct ActiveDeviceQueue {
    pub markq: VecDeque<Box<dyn PacketItem>>,
    pub validq: VecDeque<Box<dyn PacketItem>>,
}

impl ActiveDeviceQueue {
    pub fn new() -> Self {
        Self { markq: VecDeque::new(), validq: VecDeque::new() }
    }

    pub fn is_idle(&self) -> bool {
        self.markq.is_empty() && self.validq.is_empty()
    }

    /// Moves everything queued for this pass (`validq` first, FIFO-oldest
    /// first, then fresh `markq` arrivals) into a single batch and hands
    /// it to the device. Whatever the device didn't take becomes the new
    /// `validq`, so the queue stays on the active list until it's empty.
    pub fn flush(&mut self, device: &mut dyn DeviceQueue) -> TransmitStatus {
        let mut batch = std::mem::take(&mut self.validq);
        batch.append(&mut self.markq);
        let (remaining, status) = device.try_transmit(batch);
        self.validq = remaining;
        status
    }
}

impl Default for ActiveDeviceQueue {
    fn default() -> Self {
        Self::new()
    }
}
