//! Cache-line-aware wait-free SPSC mailbox.
//!
//! Each slot is a single `AtomicU64`. A slot's own content — zero, or a
//! sequence-bit mismatch against the reader's current lap — is enough to
//! tell a fresh entry from a stale one. Neither side ever inspects the
//! other's cursor on the fast path; the producer's "is there room" check
//! only fires once per cache line, and the consumer defers zeroing a
//! cache line's slots until the whole line has been read, amortizing
//! that write-back over `line_entries` extracts instead of paying it on
//! every one.
//!
//! Four monotonic indices (mod `capacity`, never wrapped in storage) hold
//! the invariant `cons_clear <= cons_read <= prod_write <= prod_check <=
//! cons_clear + capacity`:
//!
//! - `prod_write` — next slot the producer will write.
//! - `prod_check` — furthest slot the producer has confirmed empty.
//! - `cons_read`  — next slot the consumer will read.
//! - `cons_clear` — furthest slot the consumer has zeroed.

pub mod slot;

pub use slot::{ItemToken, MailboxHandle, MailboxItem};

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{PspatError, Result};

/// Slot and cache-line layout for a `Mailbox`.
#[derive(Debug, Clone, Copy)]
pub struct MailboxConfig {
    /// Number of slots. Must be a power of two.
    pub entries: usize,
    /// Cache line size in bytes. Must be a power of two no larger than
    /// half of `entries`, and must divide evenly into whole `u64` slots.
    pub line_size: usize,
}

impl MailboxConfig {
    pub fn new(entries: usize, line_size: usize) -> Result<Self> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(PspatError::config("mailbox entries must be a power of two"));
        }
        if line_size == 0 || !line_size.is_power_of_two() {
            return Err(PspatError::config("mailbox line_size must be a power of two"));
        }
        if line_size < std::mem::size_of::<u64>() {
            return Err(PspatError::config("mailbox line_size smaller than a slot"));
        }
        let line_entries = line_size / std::mem::size_of::<u64>();
        if entries <= 2 * line_entries {
            return Err(PspatError::config("mailbox entries too small for line_size"));
        }
        Ok(Self { entries, line_size })
    }

    fn line_entries(&self) -> usize {
        self.line_size / std::mem::size_of::<u64>()
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_MAILBOX_ENTRIES, crate::constants::DEFAULT_LINE_SIZE)
            .expect("built-in defaults are valid")
    }
}

/// Producer-side cursors, padded to their own cache line so a busy consumer
/// never invalidates them.
#[repr(align(64))]
struct ProducerCursors {
    write: AtomicU64,
    check: AtomicU64,
    _padding: [u8; 48],
}

/// Consumer-side cursors, padded to their own cache line.
#[repr(align(64))]
struct ConsumerCursors {
    read: AtomicU64,
    clear: AtomicU64,
    _padding: [u8; 48],
}

struct Inner<T> {
    slots: Box<[AtomicU64]>,
    mask: u64,
    log2_entries: u32,
    line_entries: u64,
    producer: ProducerCursors,
    consumer: ConsumerCursors,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: MailboxItem> Inner<T> {
    fn insert_word(&self, word: u64) -> std::result::Result<(), ()> {
        let write = self.producer.write.load(Ordering::Relaxed);
        let check = self.producer.check.load(Ordering::Relaxed);

        if write == check {
            let probe_idx = ((check + self.line_entries) & self.mask) as usize;
            let probe = self.slots[probe_idx].load(Ordering::Acquire);
            if probe != 0 {
                return Err(());
            }
            self.producer.check.store(check + self.line_entries, Ordering::Relaxed);
        }

        let idx = (write & self.mask) as usize;
        let lap_bit = (write >> self.log2_entries) & 1;
        self.slots[idx].store(word | lap_bit, Ordering::Release);
        self.producer.write.store(write + 1, Ordering::Relaxed);
        Ok(())
    }

    fn slot_word(&self, read: u64) -> Option<u64> {
        let idx = (read & self.mask) as usize;
        let word = self.slots[idx].load(Ordering::Acquire);
        let expected_bit = (read >> self.log2_entries) & 1;
        if word == 0 || ((word ^ expected_bit) & 1) != 0 {
            None
        } else {
            Some(word)
        }
    }

    fn is_empty(&self) -> bool {
        let read = self.consumer.read.load(Ordering::Relaxed);
        self.slot_word(read).is_none()
    }

    fn extract_word(&self) -> Option<u64> {
        let read = self.consumer.read.load(Ordering::Relaxed);
        let word = self.slot_word(read)?;
        self.consumer.read.store(read + 1, Ordering::Relaxed);
        Some(word & !1)
    }

    fn clear(&self) {
        let read = self.consumer.read.load(Ordering::Relaxed);
        let line_mask = self.line_entries - 1;
        let target = read & !line_mask;
        let mut clear = self.consumer.clear.load(Ordering::Relaxed);

        while (clear & !line_mask) != target {
            for offset in 0..self.line_entries {
                let idx = ((clear + offset) & self.mask) as usize;
                self.slots[idx].store(0, Ordering::Release);
            }
            clear += self.line_entries;
        }
        self.consumer.clear.store(clear, Ordering::Relaxed);
    }

    /// Advisory prefetch of the slot the next extract will touch.
    fn prefetch_next_read(&self) {
        let read = self.consumer.read.load(Ordering::Relaxed);
        let idx = (read & self.mask) as usize;
        prefetch_read(&self.slots[idx]);
    }
}

#[cfg(target_arch = "x86_64")]
fn prefetch_read(cell: &AtomicU64) {
    use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
    unsafe {
        _mm_prefetch(cell as *const AtomicU64 as *const i8, _MM_HINT_T0);
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn prefetch_read(_cell: &AtomicU64) {}

/// A freshly built mailbox, split into its producer and consumer halves.
///
/// Exactly one `MailboxProducer` and one `MailboxConsumer` exist per
/// mailbox: the split happens once, at construction, so neither side can
/// later acquire the other's handle.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

impl<T: MailboxItem> Mailbox<T> {
    pub fn new(config: MailboxConfig) -> Self {
        let entries = config.entries;
        let slots = (0..entries).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into_boxed_slice();
        let inner = Arc::new(Inner {
            slots,
            mask: (entries - 1) as u64,
            log2_entries: entries.trailing_zeros(),
            line_entries: config.line_entries() as u64,
            producer: ProducerCursors { write: AtomicU64::new(0), check: AtomicU64::new(0), _padding: [0; 48] },
            consumer: ConsumerCursors { read: AtomicU64::new(0), clear: AtomicU64::new(0), _padding: [0; 48] },
            _marker: PhantomData,
        });
        Self { inner }
    }

    /// Splits the mailbox into its producer and consumer halves.
    pub fn split(self) -> (MailboxProducer<T>, MailboxConsumer<T>) {
        (MailboxProducer { inner: self.inner.clone() }, MailboxConsumer { inner: self.inner })
    }
}

/// The write-only half of a mailbox. Owned by exactly one producer thread.
///
/// `Inner<T>` never stores a `T` itself (only its `u64` encoding), so it
/// is `Send + Sync` for every `T` and this half inherits that without
/// needing an unsafe impl of its own.
pub struct MailboxProducer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: MailboxItem> MailboxProducer<T> {
    pub fn insert(&self, item: T) -> Result<()> {
        let word = item.encode();
        debug_assert_eq!(word & 1, 0, "MailboxItem::encode must clear the low bit");
        debug_assert_ne!(word, 0, "MailboxItem::encode must never return zero");
        self.inner.insert_word(word).map_err(|_| PspatError::MailboxFull)
    }
}

/// The read-only half of a mailbox. Owned by exactly one consumer thread.
pub struct MailboxConsumer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: MailboxItem> MailboxConsumer<T> {
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn extract(&self) -> Option<T> {
        self.inner.extract_word().map(T::decode)
    }

    /// Zeroes every fully-read cache line since the last call.
    ///
    /// Call this after a batch of `extract` calls, not after every one:
    /// that's what amortizes the write-back over a whole line.
    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn prefetch(&self) {
        self.inner.prefetch_next_read();
    }
}
