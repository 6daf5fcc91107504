//! Capability descriptors for masters and slaves.
//!
//! Capabilities are filled in once, either by a peripheral driver or from a
//! topology file, and only read by the core afterwards. Port configuration
//! checks stream parameters against them and the solver uses the slave port
//! clock lists to reject bus clocks a peripheral cannot follow.

use crate::error::{Error, Result};
use crate::regs::MAX_PORTS;
use crate::stream::StreamParams;
use serde::{Deserialize, Serialize};

/// A set of supported values: an explicit list or an inclusive range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Support<T> {
    /// Only the listed values.
    List(Vec<T>),
    /// Every value from `min` to `max` inclusive.
    Range {
        /// Lowest supported value.
        min: T,
        /// Highest supported value.
        max: T,
    },
}

impl<T: PartialOrd + Copy> Support<T> {
    /// Whether `value` is supported.
    pub fn contains(&self, value: T) -> bool {
        match self {
            Support::List(values) => values.iter().any(|v| *v == value),
            Support::Range { min, max } => *min <= value && value <= *max,
        }
    }
}

/// Which way a data port can move samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    /// Produces samples.
    Source,
    /// Consumes samples.
    Sink,
    /// Either, selected per stream.
    #[default]
    Both,
}

/// How a port moves between the unprepared and prepared states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPrepare {
    /// Ready as soon as its transport is programmed.
    Simplified,
    /// Needs the `PREPARECTRL` / `PREPARESTATUS` handshake.
    #[default]
    Normal,
}

/// One audio mode of a port: clock and sample rates that work together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMode {
    /// Bus clock frequencies in Hz.
    pub bus_freq: Support<u32>,
    /// Sample rates in Hz.
    pub sample_rate: Support<u32>,
}

/// Capabilities of one data port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCapability {
    /// Data port number (1..=14).
    pub port_num: u8,
    /// Supported direction.
    #[serde(default)]
    pub direction: PortDirection,
    /// Supported word lengths in bits.
    #[serde(default = "default_word_length")]
    pub word_length: Support<u32>,
    /// Supported channel counts.
    #[serde(default = "default_channels")]
    pub channels: Support<u32>,
    /// Prepare handshake flavor.
    #[serde(default)]
    pub prepare: ChannelPrepare,
    /// Implementation-defined interrupts the port raises.
    #[serde(default)]
    pub impl_def_intr_mask: u8,
    /// Audio modes. An empty list accepts any clock and rate.
    #[serde(default)]
    pub modes: Vec<AudioMode>,
}

fn default_word_length() -> Support<u32> {
    Support::Range { min: 1, max: 64 }
}

fn default_channels() -> Support<u32> {
    Support::Range { min: 1, max: 8 }
}

impl PortCapability {
    /// A port accepting any width up to 64 bits, up to eight channels and any clock.
    pub fn new(port_num: u8) -> Self {
        Self {
            port_num,
            direction: PortDirection::Both,
            word_length: default_word_length(),
            channels: default_channels(),
            prepare: ChannelPrepare::Normal,
            impl_def_intr_mask: 0,
            modes: Vec::new(),
        }
    }

    /// Restrict the word lengths.
    pub fn with_word_length(mut self, word_length: Support<u32>) -> Self {
        self.word_length = word_length;
        self
    }

    /// Restrict the channel counts.
    pub fn with_channels(mut self, channels: Support<u32>) -> Self {
        self.channels = channels;
        self
    }

    /// Set the prepare handshake flavor.
    pub fn with_prepare(mut self, prepare: ChannelPrepare) -> Self {
        self.prepare = prepare;
        self
    }

    /// Set the direction.
    pub fn with_direction(mut self, direction: PortDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Add an audio mode.
    pub fn with_mode(mut self, mode: AudioMode) -> Self {
        self.modes.push(mode);
        self
    }

    /// Whether some audio mode runs at bus clock `clk`.
    pub fn accepts_clock(&self, clk: u32) -> bool {
        self.modes.is_empty() || self.modes.iter().any(|m| m.bus_freq.contains(clk))
    }

    /// Whether some audio mode supports sample rate `rate`.
    pub fn accepts_rate(&self, rate: u32) -> bool {
        self.modes.is_empty() || self.modes.iter().any(|m| m.sample_rate.contains(rate))
    }

    /// Check word length and channel count.
    pub fn check_format(&self, params: &StreamParams) -> Result<()> {
        if !self.word_length.contains(params.bps) {
            return Err(Error::invalid(format!(
                "port {}: word length {} not supported",
                self.port_num, params.bps
            )));
        }
        if !self.channels.contains(params.channel_count) {
            return Err(Error::invalid(format!(
                "port {}: channel count {} not supported",
                self.port_num, params.channel_count
            )));
        }
        Ok(())
    }

    /// Check sample rate, word length and channel count.
    pub fn check_stream(&self, params: &StreamParams) -> Result<()> {
        if !self.accepts_rate(params.rate) {
            return Err(Error::invalid(format!(
                "port {}: sample rate {} Hz not supported",
                self.port_num, params.rate
            )));
        }
        self.check_format(params)
    }
}

fn check_port_numbers(ports: &[PortCapability]) -> Result<()> {
    for (idx, port) in ports.iter().enumerate() {
        if port.port_num == 0 || port.port_num > MAX_PORTS {
            return Err(Error::invalid(format!(
                "port number {} out of range 1..={MAX_PORTS}",
                port.port_num
            )));
        }
        if ports[..idx].iter().any(|p| p.port_num == port.port_num) {
            return Err(Error::invalid(format!(
                "port {} listed twice",
                port.port_num
            )));
        }
    }
    Ok(())
}

/// Capabilities of a slave device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveCapability {
    /// Implements the address paging registers.
    pub paging_supported: bool,
    /// Supports clock stop mode 1.
    pub clock_stop1_mode_supported: bool,
    /// Uses the simplified clock stop prepare sequence.
    pub simplified_clock_stop_prepare: bool,
    /// Implements test modes.
    pub test_mode_supported: bool,
    /// Implementation-defined interrupts on the control port.
    pub scp_impl_def_intr_mask: u8,
    /// Data ports.
    pub ports: Vec<PortCapability>,
}

impl SlaveCapability {
    /// A slave with no data ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a data port.
    pub fn with_port(mut self, port: PortCapability) -> Self {
        self.ports.push(port);
        self
    }

    /// Set paging support.
    pub fn with_paging(mut self, supported: bool) -> Self {
        self.paging_supported = supported;
        self
    }

    /// Look up a data port.
    pub fn port(&self, port_num: u8) -> Option<&PortCapability> {
        self.ports.iter().find(|p| p.port_num == port_num)
    }

    /// Check that port numbers are in range and unique.
    pub fn validate(&self) -> Result<()> {
        check_port_numbers(&self.ports)
    }
}

/// Capabilities of a bus master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterCapability {
    /// Base clock in Hz. The bus clock is derived from twice this value.
    pub base_clk_freq: u32,
    /// Bit per bus that switches banks together with this one. Zero when unsynchronized.
    #[serde(default)]
    pub link_sync_mask: u32,
    /// Data ports. Only word length and channel count are consulted.
    #[serde(default)]
    pub ports: Vec<PortCapability>,
}

impl MasterCapability {
    /// A master with no data ports.
    pub fn new(base_clk_freq: u32) -> Self {
        Self {
            base_clk_freq,
            link_sync_mask: 0,
            ports: Vec::new(),
        }
    }

    /// Set the link synchronization mask.
    pub fn with_link_sync_mask(mut self, mask: u32) -> Self {
        self.link_sync_mask = mask;
        self
    }

    /// Add a data port.
    pub fn with_port(mut self, port: PortCapability) -> Self {
        self.ports.push(port);
        self
    }

    /// Look up a data port.
    pub fn port(&self, port_num: u8) -> Option<&PortCapability> {
        self.ports.iter().find(|p| p.port_num == port_num)
    }

    /// Whether bank switches on this bus are synchronized with other buses.
    pub fn is_link_synced(&self) -> bool {
        self.link_sync_mask != 0
    }

    /// Check the base clock and port numbers.
    pub fn validate(&self) -> Result<()> {
        if self.base_clk_freq == 0 {
            return Err(Error::invalid("base clock frequency is zero"));
        }
        check_port_numbers(&self.ports)
    }
}
