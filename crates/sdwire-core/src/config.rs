//! Tunables for the bus manager.
//!
//! Every field has a serde default so a partial `[tuning]` table in a topology
//! file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of stream tags in the pool.
pub const DEFAULT_STREAM_TAGS: usize = 100;

/// Timeouts, retry counts and pool sizes used by [`BusManager`](crate::BusManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Size of the stream tag pool.
    pub num_stream_tags: usize,
    /// How many times a message answered with "retry" is re-sent.
    pub transfer_retries: u32,
    /// Time budget for one message including its retries, in milliseconds.
    pub transfer_timeout_ms: u64,
    /// Bound on a synchronized multi-link bank switch, in milliseconds.
    pub bank_switch_timeout_ms: u64,
    /// Wait after a single-link bank switch write, in milliseconds.
    pub bank_switch_settle_ms: u64,
    /// Wait between writing DPn_PREPARECTRL and checking the status, in milliseconds.
    pub port_prepare_settle_ms: u64,
    /// Bound on [`wait_for_slave_enumeration`](crate::BusManager::wait_for_slave_enumeration), in milliseconds.
    pub enumeration_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            num_stream_tags: DEFAULT_STREAM_TAGS,
            transfer_retries: 3,
            transfer_timeout_ms: 2000,
            bank_switch_timeout_ms: 3000,
            bank_switch_settle_ms: 100,
            port_prepare_settle_ms: 100,
            enumeration_timeout_ms: 2000,
        }
    }
}

impl CoreConfig {
    /// Defaults with the settle delays removed, for simulated controllers.
    pub fn instant() -> Self {
        Self {
            bank_switch_settle_ms: 0,
            port_prepare_settle_ms: 0,
            ..Self::default()
        }
    }

    /// Set the stream tag pool size.
    pub fn with_num_stream_tags(mut self, n: usize) -> Self {
        self.num_stream_tags = n;
        self
    }

    /// Set the retry count for busy transfers.
    pub fn with_transfer_retries(mut self, n: u32) -> Self {
        self.transfer_retries = n;
        self
    }

    /// Set the per-message transfer time budget.
    pub fn with_transfer_timeout_ms(mut self, ms: u64) -> Self {
        self.transfer_timeout_ms = ms;
        self
    }

    /// Set the synchronized bank switch bound.
    pub fn with_bank_switch_timeout_ms(mut self, ms: u64) -> Self {
        self.bank_switch_timeout_ms = ms;
        self
    }

    /// Set the enumeration wait bound.
    pub fn with_enumeration_timeout_ms(mut self, ms: u64) -> Self {
        self.enumeration_timeout_ms = ms;
        self
    }

    /// Per-message transfer budget.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Synchronized bank switch bound.
    pub fn bank_switch_timeout(&self) -> Duration {
        Duration::from_millis(self.bank_switch_timeout_ms)
    }

    /// Single-link bank switch settle time.
    pub fn bank_switch_settle(&self) -> Duration {
        Duration::from_millis(self.bank_switch_settle_ms)
    }

    /// Port prepare settle time.
    pub fn port_prepare_settle(&self) -> Duration {
        Duration::from_millis(self.port_prepare_settle_ms)
    }

    /// Enumeration wait bound.
    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_millis(self.enumeration_timeout_ms)
    }
}
