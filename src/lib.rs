//! PSPAT - Parallel Scheduler for Packet Arbitration Tasks
//!
//! Per-CPU lock-free mailboxes feed a single arbiter task that applies
//! traffic shaping, rate pacing, and transmit dispatch across the
//! device's queues. Producers never touch a shaping queue directly;
//! the arbiter is the only thread that ever owns one.

pub mod arbiter;
pub mod client_queue;
pub mod clock;
pub mod config;
pub mod constants;
pub mod cpu;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod item;
pub mod mailbox;
pub mod metrics;
pub mod shaping;

pub use arbiter::{Arbiter, ArbiterCommand, ArbiterHandle, LoopOutcome};
pub use client_queue::{build_client_queue_table, ClientQueue, ProducerDropCounters, ProducerSubmitHandle};
pub use clock::{Clock, MonotonicClock};
pub use config::{PspatConfig, PspatConfigBuilder, XmitMode};
pub use device::{ActiveDeviceQueue, DeviceQueue, TransmitStatus};
pub use dispatcher::Dispatcher;
pub use error::{PspatError, Result};
pub use item::{DeviceQueueId, PacketItem};
pub use mailbox::{Mailbox, MailboxConfig, MailboxConsumer, MailboxItem, MailboxProducer};
pub use metrics::{ArbiterMetrics, ArbiterStats};
pub use shaping::{BypassFifoQueue, EnqueueOutcome, ShapingQueue, ShapingQueueAdapter};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
