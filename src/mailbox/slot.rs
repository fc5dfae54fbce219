//! Encoding of mailbox payloads into the single atomic word each slot stores.

/// Anything that can live in a mailbox slot.
///
/// A slot holds one `u64`. `encode` must return a value whose low bit is
/// clear and which is never zero — zero is the "empty slot" sentinel and
/// the low bit carries the producer's sequence parity. `decode` is the
/// exact inverse of `encode` for any value `encode` can produce.
pub trait MailboxItem: Sized {
    fn encode(self) -> u64;
    fn decode(word: u64) -> Self;
}

/// An opaque, non-reusable handle to something pushed through a mailbox.
///
/// `ClientQueue` hands these out instead of raw indices so that a producer
/// mailbox pointer can't be confused with a stale one after reuse; see
/// `MailboxHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemToken(u64);

impl ItemToken {
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn index(self) -> u64 {
        self.0
    }
}

impl MailboxItem for ItemToken {
    fn encode(self) -> u64 {
        (self.0.wrapping_add(1)) << 1
    }

    fn decode(word: u64) -> Self {
        Self((word >> 1).wrapping_sub(1))
    }
}

/// Identifies a producer's payload mailbox inside the arbiter's client-list
/// mailbox, by monotonic identifier rather than by address.
///
/// A producer CPU slot is reused across the lifetime of a process; comparing
/// handles by identifier (see `ClientQueue::identifier`) rather than by
/// pointer is what lets the arbiter tell a freshly created mailbox apart
/// from a freed one that happened to land at the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailboxHandle {
    pub identifier: u64,
    pub slot: u64,
}

impl MailboxHandle {
    pub fn new(identifier: u64, slot: u64) -> Self {
        Self { identifier, slot }
    }
}

impl MailboxItem for MailboxHandle {
    fn encode(self) -> u64 {
        debug_assert!(self.slot <= u32::MAX as u64, "mailbox slot index out of range");
        // `identifier` must leave room for the slot's 32 bits plus the
        // sequence bit shifted in on top; `<= u32::MAX` would let
        // `packed << 1` carry a bit out of the word, corrupting the
        // round-trip (e.g. identifier=0x8000_0000, slot=0 used to decode
        // back as identifier=0).
        debug_assert!(self.identifier < (1u64 << 31), "mailbox identifier out of range");
        // `next_identifier()` hands out 1, 2, 3, ... and never 0, so
        // `packed` is never zero and `encode` never needs to bump it
        // the way `ItemToken::encode` does for its own zero case.
        debug_assert_ne!(self.identifier, 0, "mailbox identifier must never be zero");
        let packed = (self.identifier << 32) | self.slot;
        packed << 1
    }

    fn decode(word: u64) -> Self {
        let packed = word >> 1;
        Self {
            identifier: packed >> 32,
            slot: packed & 0xFFFF_FFFF,
        }
    }
}
