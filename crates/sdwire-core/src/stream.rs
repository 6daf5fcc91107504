//! Stream and runtime data model.
//!
//! A [`Stream`] is one logical audio flow identified by a [`StreamTag`]. It
//! spans one [`MasterRuntime`] per bus it touches; each master runtime owns the
//! [`SlaveRuntime`]s of the peripherals on that bus and both own
//! [`PortRuntime`]s describing the channels they move.

use crate::bus::BusId;
use crate::error::{Error, Result};
use crate::slave::SlaveId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque stream handle. Tags start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamTag(pub u32);

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Data direction relative to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Master to slave (playback).
    #[default]
    Out,
    /// Slave to master (capture).
    In,
}

/// Payload type carried by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Linear PCM.
    #[default]
    Pcm,
    /// Pulse density modulation.
    Pdm,
}

/// Stream and runtime lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Allocated, nothing configured.
    #[default]
    Init,
    /// Parameters and ports configured.
    Config,
    /// Bandwidth committed and ports prepared.
    Prepare,
    /// Channels running.
    Enable,
    /// Channels stopped, bandwidth still committed.
    Disable,
    /// Bandwidth released.
    Unprepare,
}

impl StreamState {
    /// Whether a runtime in this state counts toward bus bandwidth.
    pub const fn holds_bandwidth(self) -> bool {
        matches!(
            self,
            StreamState::Prepare | StreamState::Enable | StreamState::Disable
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Init => "init",
            StreamState::Config => "config",
            StreamState::Prepare => "prepare",
            StreamState::Enable => "enable",
            StreamState::Disable => "disable",
            StreamState::Unprepare => "unprepare",
        };
        f.write_str(s)
    }
}

/// Audio format of a stream or runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamParams {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Channel count.
    pub channel_count: u32,
    /// Bits per sample.
    pub bps: u32,
}

impl StreamParams {
    /// Create stream parameters.
    pub const fn new(rate: u32, channel_count: u32, bps: u32) -> Self {
        Self {
            rate,
            channel_count,
            bps,
        }
    }

    /// Bus bandwidth in bits per second.
    pub const fn bandwidth(&self) -> u64 {
        self.rate as u64 * self.channel_count as u64 * self.bps as u64
    }

    /// Bits one frame of samples occupies.
    pub const fn bits_per_sample_frame(&self) -> u32 {
        self.channel_count * self.bps
    }
}

/// What a caller passes to [`config_stream`](crate::BusManager::config_stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Channels this endpoint contributes.
    pub channel_count: u32,
    /// Bits per sample.
    pub bps: u32,
    /// Direction relative to the master.
    pub direction: Direction,
    /// Payload type.
    #[serde(default)]
    pub kind: StreamKind,
}

impl StreamConfig {
    /// Create a PCM stream configuration.
    pub const fn new(rate: u32, channel_count: u32, bps: u32, direction: Direction) -> Self {
        Self {
            rate,
            channel_count,
            bps,
            direction,
            kind: StreamKind::Pcm,
        }
    }

    /// Change the payload type.
    pub const fn with_kind(mut self, kind: StreamKind) -> Self {
        self.kind = kind;
        self
    }

    /// The audio format portion.
    pub const fn params(&self) -> StreamParams {
        StreamParams::new(self.rate, self.channel_count, self.bps)
    }
}

/// Which side of the bus a config or release call refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// The bus master.
    Master(BusId),
    /// A slave on a bus.
    Slave(SlaveId),
}

impl Endpoint {
    /// The bus this endpoint lives on.
    pub fn bus(&self) -> BusId {
        match self {
            Endpoint::Master(bus) => *bus,
            Endpoint::Slave(slave) => slave.bus,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Master(bus) => write!(f, "master {bus}"),
            Endpoint::Slave(slave) => write!(f, "slave {slave}"),
        }
    }
}

/// Port and channel selection passed to [`config_port`](crate::BusManager::config_port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Data port number (1..=14).
    pub port_num: u8,
    /// Channels used on this port.
    pub ch_mask: u8,
}

impl PortConfig {
    /// Create a port selection.
    pub const fn new(port_num: u8, ch_mask: u8) -> Self {
        Self { port_num, ch_mask }
    }
}

/// Transport registers of one port in one bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportParams {
    /// Bits between consecutive samples of this port.
    pub sample_interval: u32,
    /// Block offset, low byte.
    pub offset1: u8,
    /// Block offset, high byte.
    pub offset2: u8,
    /// First column of the horizontal window.
    pub hstart: u8,
    /// Last column of the horizontal window.
    pub hstop: u8,
    /// Block group control.
    pub block_group_control: u8,
    /// Whether `block_group_control` is implemented by the port.
    pub block_group_control_valid: bool,
    /// Block packing mode.
    pub block_packing_mode: u8,
    /// Data lane.
    pub lane_control: u8,
}

impl TransportParams {
    /// Register image starting at `BLOCKCTRL2`.
    ///
    /// Ports without block group control take one byte less, which drops the
    /// `BLOCKCTRL2` byte from the front.
    pub fn register_bytes(&self) -> Vec<u8> {
        let interval = self.sample_interval.saturating_sub(1);
        let bytes = [
            self.block_group_control,
            (interval & 0xff) as u8,
            ((interval >> 8) & 0xff) as u8,
            self.offset1,
            self.offset2,
            (self.hstart << 4) | (self.hstop & 0x0f),
            self.block_packing_mode,
            self.lane_control,
        ];
        if self.block_group_control_valid {
            bytes.to_vec()
        } else {
            bytes[1..].to_vec()
        }
    }

    /// Combined 16-bit block offset.
    pub fn offset(&self) -> u16 {
        u16::from(self.offset1) | (u16::from(self.offset2) << 8)
    }
}

/// Port control parameters of one port in one bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortParams {
    /// Word length in bits.
    pub word_length: u32,
    /// Flow mode.
    pub flow_mode: u8,
    /// Data mode.
    pub data_mode: u8,
}

/// One port of a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRuntime {
    /// Data port number.
    pub port_num: u8,
    /// Channels used on this port.
    pub ch_mask: u8,
    /// Transport registers computed by the solver.
    pub transport: TransportParams,
    /// Port control parameters.
    pub params: PortParams,
}

impl PortRuntime {
    /// A port with no transport computed yet.
    pub fn new(port_num: u8, ch_mask: u8) -> Self {
        Self {
            port_num,
            ch_mask,
            transport: TransportParams::default(),
            params: PortParams::default(),
        }
    }
}

/// One slave taking part in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveRuntime {
    /// The slave.
    pub slave: SlaveId,
    /// Direction relative to the master.
    pub direction: Direction,
    /// Audio format the slave uses.
    pub params: StreamParams,
    /// Ports the slave uses.
    pub ports: Vec<PortRuntime>,
    /// Lifecycle state, kept in step with the owning master runtime.
    pub state: StreamState,
}

impl SlaveRuntime {
    pub(crate) fn new(slave: SlaveId, config: &StreamConfig) -> Self {
        Self {
            slave,
            direction: config.direction,
            params: config.params(),
            ports: Vec::new(),
            state: StreamState::Config,
        }
    }
}

/// One bus taking part in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRuntime {
    /// The bus.
    pub bus: BusId,
    /// Direction relative to the master.
    pub direction: Direction,
    /// Audio format the master uses.
    pub params: StreamParams,
    /// Master ports.
    pub ports: Vec<PortRuntime>,
    /// Slaves on this bus taking part in the stream.
    pub slaves: Vec<SlaveRuntime>,
    /// Lifecycle state. `Init` means only slaves have joined so far.
    pub state: StreamState,
    /// Bandwidth committed to the bus by this runtime.
    pub stream_bw: u64,
    /// First column of the horizontal window.
    pub hstart: u8,
    /// Last column of the horizontal window.
    pub hstop: u8,
    /// Running offset after the master ports.
    pub block_offset: u16,
}

impl MasterRuntime {
    pub(crate) fn new(bus: BusId) -> Self {
        Self {
            bus,
            direction: Direction::Out,
            params: StreamParams::default(),
            ports: Vec::new(),
            slaves: Vec::new(),
            state: StreamState::Init,
            stream_bw: 0,
            hstart: 0,
            hstop: 0,
            block_offset: 0,
        }
    }

    /// Set the state of the runtime and all of its slaves.
    pub(crate) fn set_state(&mut self, state: StreamState) {
        self.state = state;
        for slave in &mut self.slaves {
            slave.state = state;
        }
    }

    /// Slave runtimes for one slave.
    pub fn slave_runtimes(&self, slave: SlaveId) -> impl Iterator<Item = &SlaveRuntime> {
        self.slaves.iter().filter(move |s| s.slave == slave)
    }
}

/// A logical audio stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    tag: StreamTag,
    /// Payload type.
    pub kind: StreamKind,
    /// Aggregate audio format.
    pub params: StreamParams,
    /// Aggregate lifecycle state.
    pub state: StreamState,
    /// One runtime per bus, in the order buses joined.
    pub masters: Vec<MasterRuntime>,
    tx_refs: u32,
    rx_refs: u32,
}

impl Stream {
    pub(crate) fn new(tag: StreamTag) -> Self {
        Self {
            tag,
            kind: StreamKind::Pcm,
            params: StreamParams::default(),
            state: StreamState::Init,
            masters: Vec::new(),
            tx_refs: 0,
            rx_refs: 0,
        }
    }

    /// The stream tag.
    pub fn tag(&self) -> StreamTag {
        self.tag
    }

    /// Number of playback and capture endpoints configured.
    pub fn refs(&self) -> (u32, u32) {
        (self.tx_refs, self.rx_refs)
    }

    /// The runtime on `bus`, if any.
    pub fn master(&self, bus: BusId) -> Option<&MasterRuntime> {
        self.masters.iter().find(|m| m.bus == bus)
    }

    pub(crate) fn master_mut(&mut self, bus: BusId) -> Option<&mut MasterRuntime> {
        self.masters.iter_mut().find(|m| m.bus == bus)
    }

    /// Find or create the runtime on `bus`. The flag is true when it was created.
    pub(crate) fn master_or_insert(&mut self, bus: BusId) -> (&mut MasterRuntime, bool) {
        match self.masters.iter().position(|m| m.bus == bus) {
            Some(idx) => (&mut self.masters[idx], false),
            None => {
                self.masters.push(MasterRuntime::new(bus));
                let last = self.masters.len() - 1;
                (&mut self.masters[last], true)
            }
        }
    }

    /// All slave runtimes across buses.
    pub fn slaves(&self) -> impl Iterator<Item = &SlaveRuntime> {
        self.masters.iter().flat_map(|m| m.slaves.iter())
    }

    /// Fold one endpoint's configuration into the aggregate parameters.
    ///
    /// Playback endpoints must agree on rate and width; their channels add up.
    /// Capture endpoints only seed the parameters of a stream that has none.
    /// Nothing is modified when an error is returned.
    pub(crate) fn accumulate(&mut self, config: &StreamConfig) -> Result<()> {
        match config.direction {
            Direction::Out if self.tx_refs == 0 => {
                self.params = config.params();
                self.tx_refs = 1;
            }
            Direction::Out => {
                if self.params.rate != config.rate {
                    return Err(Error::invalid(format!(
                        "{}: frame rate for aggregated devices not matching ({} != {})",
                        self.tag, config.rate, self.params.rate
                    )));
                }
                if self.params.bps != config.bps {
                    return Err(Error::invalid(format!(
                        "{}: bps for aggregated devices not matching ({} != {})",
                        self.tag, config.bps, self.params.bps
                    )));
                }
                self.params.channel_count += config.channel_count;
                self.tx_refs += 1;
            }
            Direction::In => {
                if self.tx_refs == 0 && self.params.rate == 0 {
                    self.params = config.params();
                }
                self.rx_refs += 1;
            }
        }
        self.kind = config.kind;
        Ok(())
    }

    /// Undo one endpoint's reference.
    pub(crate) fn drop_ref(&mut self, direction: Direction) {
        match direction {
            Direction::Out => self.tx_refs = self.tx_refs.saturating_sub(1),
            Direction::In => self.rx_refs = self.rx_refs.saturating_sub(1),
        }
    }
}
