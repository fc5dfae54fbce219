//! Arbiter control surface.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::{PspatError, Result};
use crate::mailbox::MailboxConfig;

/// Transmit path the arbiter's emit phase takes for a ready packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmitMode {
    /// Arbiter validates and transmits the packet itself.
    Arbiter,
    /// Arbiter hands the packet to a dispatcher's mailbox instead.
    Dispatch,
    /// Arbiter discards the packet (used to measure arbitration overhead
    /// in isolation from transmit cost).
    Drop,
}

/// Validated configuration for an `Arbiter`.
///
/// Constructed through `PspatConfig::builder()`; `build()` is the only
/// way to get one, and it rejects inconsistent combinations up front
/// instead of letting the arbiter loop discover them at runtime.
#[derive(Debug, Clone)]
pub struct PspatConfig {
    pub enabled: bool,
    pub xmit_mode: XmitMode,
    pub single_txq: bool,
    pub tc_bypass: bool,
    pub rate_bytes_per_sec: u64,
    pub arb_interval_ns: u64,
    pub arb_qdisc_batch: usize,
    pub dispatch_batch: usize,
    pub dispatch_sleep_us: u64,
    pub mailbox: MailboxConfig,
}

impl Default for PspatConfig {
    fn default() -> Self {
        PspatConfigBuilder::default().build().expect("built-in defaults are valid")
    }
}

impl PspatConfig {
    pub fn builder() -> PspatConfigBuilder {
        PspatConfigBuilder::default()
    }

    /// Builds the shared `enable` flag seeded from this config, for the
    /// caller to hand to both `build_client_queue_table` (producer side)
    /// and `Arbiter::new` (arbiter side) so the two halves of the
    /// control surface's `enable` switch stay in lockstep.
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(self.enabled))
    }
}

/// Builder for `PspatConfig`. Mirrors the kernel module's boot/sysfs
/// parameters: `xmit_mode`, `single_txq`, `tc_bypass`, `rate`,
/// `arb_sleep_ns`, `arb_qdisc_batch`, `dispatch_batch`, `dispatch_sleep_us`.
#[derive(Debug, Clone)]
pub struct PspatConfigBuilder {
    enabled: bool,
    xmit_mode: XmitMode,
    single_txq: bool,
    tc_bypass: bool,
    rate_bytes_per_sec: u64,
    arb_interval_ns: u64,
    arb_qdisc_batch: usize,
    dispatch_batch: usize,
    dispatch_sleep_us: u64,
    mailbox_entries: usize,
    mailbox_line_size: usize,
}

impl Default for PspatConfigBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            xmit_mode: XmitMode::Arbiter,
            single_txq: false,
            tc_bypass: false,
            rate_bytes_per_sec: 0,
            arb_interval_ns: crate::constants::DEFAULT_ARB_INTERVAL_NS,
            arb_qdisc_batch: crate::constants::DEFAULT_QDISC_BATCH_LIMIT,
            dispatch_batch: crate::constants::DEFAULT_DISPATCH_BATCH,
            dispatch_sleep_us: crate::constants::DEFAULT_DISPATCH_SLEEP_US,
            mailbox_entries: crate::constants::DEFAULT_MAILBOX_ENTRIES,
            mailbox_line_size: crate::constants::DEFAULT_LINE_SIZE,
        }
    }
}

impl PspatConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn xmit_mode(mut self, mode: XmitMode) -> Self {
        self.xmit_mode = mode;
        self
    }

    pub fn single_txq(mut self, single: bool) -> Self {
        self.single_txq = single;
        self
    }

    pub fn tc_bypass(mut self, bypass: bool) -> Self {
        self.tc_bypass = bypass;
        self
    }

    /// Zero means unpaced: the arbiter dequeues as fast as `arb_qdisc_batch`
    /// and the shaping queue allow, with no `next_link_idle` delay.
    pub fn rate_bytes_per_sec(mut self, rate: u64) -> Self {
        self.rate_bytes_per_sec = rate;
        self
    }

    pub fn arb_interval_ns(mut self, ns: u64) -> Self {
        self.arb_interval_ns = ns;
        self
    }

    pub fn arb_qdisc_batch(mut self, batch: usize) -> Self {
        self.arb_qdisc_batch = batch;
        self
    }

    pub fn dispatch_batch(mut self, batch: usize) -> Self {
        self.dispatch_batch = batch;
        self
    }

    pub fn dispatch_sleep_us(mut self, us: u64) -> Self {
        self.dispatch_sleep_us = us;
        self
    }

    pub fn mailbox_entries(mut self, entries: usize) -> Self {
        self.mailbox_entries = entries;
        self
    }

    pub fn mailbox_line_size(mut self, line_size: usize) -> Self {
        self.mailbox_line_size = line_size;
        self
    }

    pub fn build(self) -> Result<PspatConfig> {
        if self.arb_qdisc_batch == 0 {
            return Err(PspatError::config("arb_qdisc_batch must be > 0"));
        }
        if self.dispatch_batch == 0 {
            return Err(PspatError::config("dispatch_batch must be > 0"));
        }
        if matches!(self.xmit_mode, XmitMode::Dispatch) && self.dispatch_batch == 0 {
            return Err(PspatError::config("dispatch xmit_mode requires dispatch_batch > 0"));
        }
        let mailbox = MailboxConfig::new(self.mailbox_entries, self.mailbox_line_size)?;

        Ok(PspatConfig {
            enabled: self.enabled,
            xmit_mode: self.xmit_mode,
            single_txq: self.single_txq,
            tc_bypass: self.tc_bypass,
            rate_bytes_per_sec: self.rate_bytes_per_sec,
            arb_interval_ns: self.arb_interval_ns,
            arb_qdisc_batch: self.arb_qdisc_batch,
            dispatch_batch: self.dispatch_batch,
            dispatch_sleep_us: self.dispatch_sleep_us,
            mailbox,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PspatConfig::default();
        assert!(config.enabled);
        assert_eq!(config.xmit_mode, XmitMode::Arbiter);
    }

    #[test]
    fn enabled_flag_is_seeded_from_config() {
        use std::sync::atomic::Ordering;

        let on = PspatConfig::builder().enabled(true).build().unwrap();
        assert!(on.enabled_flag().load(Ordering::Relaxed));

        let off = PspatConfig::builder().enabled(false).build().unwrap();
        assert!(!off.enabled_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn rejects_zero_batch() {
        let result = PspatConfig::builder().arb_qdisc_batch(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_overrides_apply() {
        let config = PspatConfig::builder()
            .xmit_mode(XmitMode::Dispatch)
            .rate_bytes_per_sec(125_000_000)
            .dispatch_batch(16)
            .build()
            .unwrap();
        assert_eq!(config.xmit_mode, XmitMode::Dispatch);
        assert_eq!(config.rate_bytes_per_sec, 125_000_000);
        assert_eq!(config.dispatch_batch, 16);
    }
}
