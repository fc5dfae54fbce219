//! Error types for PSPAT.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PspatError>;

/// Every failure mode named in the arbiter's error handling design.
///
/// None of these are fatal to the arbiter loop: the loop bumps a
/// counter, drains or drops the offending item, and continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PspatError {
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Producer mailbox or client-list mailbox saturated.
    #[error("mailbox full")]
    MailboxFull,

    /// Shaping queue refused an item.
    #[error("shaping queue rejected item")]
    ShapingEnqueueReject,

    /// Could not steal ownership of a shaping queue.
    #[error("could not steal shaping queue (already running)")]
    ShapingStealConflict,

    /// Dispatcher mailbox rejected an item.
    #[error("dispatcher mailbox full")]
    DispatcherFull,

    /// Device refused a transmit.
    #[error("device busy")]
    DeviceBusy,

    /// Submission attempted while the arbiter is not registered.
    ///
    /// Distinct from `MailboxFull`: callers are expected to fall back
    /// to their own default path, not treat this as backpressure.
    #[error("arbiter not enabled")]
    NotEnabled,

    /// Allocation failed while creating a mailbox.
    #[error("out of memory: {message}")]
    OutOfMemory { message: String },
}

impl PspatError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::OutOfMemory { message: message.into() }
    }
}
