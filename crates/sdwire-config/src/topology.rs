//! Topology file format and operations.

use serde::{Deserialize, Serialize};
use std::path::Path;

use sdwire_core::{
    CoreConfig, DevId, Direction, MasterCapability, PortCapability, PortConfig, SlaveCapability,
    StreamConfig, StreamKind,
};

use crate::error::ConfigError;

/// A board description: bus masters, the slaves wired to them and the
/// streams to run across them.
///
/// # TOML Format
///
/// ```toml
/// [tuning]
/// bank_switch_settle_ms = 0
///
/// [[masters]]
/// name = "link0"
/// base_clk_freq = 24576000
/// [[masters.ports]]
/// port_num = 1
///
/// [[masters.slaves]]
/// name = "codec"
/// dev_id = "00:30:02:5d:07:11"
/// [[masters.slaves.caps.ports]]
/// port_num = 1
///
/// [[streams]]
/// name = "playback"
/// rate = 48000
/// channels = 2
/// bps = 16
/// [[streams.masters]]
/// master = "link0"
/// ports = [{ port = 1, ch_mask = 3 }]
/// [[streams.slaves]]
/// slave = "codec"
/// ports = [{ port = 1, ch_mask = 3 }]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Topology {
    /// Core tunables.
    #[serde(default)]
    pub tuning: CoreConfig,

    /// Bus masters in registration order.
    #[serde(default)]
    pub masters: Vec<MasterConfig>,

    /// Stream scenarios in the order they are started.
    #[serde(default)]
    pub streams: Vec<StreamScenario>,
}

/// One bus master and the slaves on its link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterConfig {
    /// Name streams refer to.
    pub name: String,

    /// Base clock in Hz.
    pub base_clk_freq: u32,

    /// Links that switch banks together with this one.
    #[serde(default)]
    pub link_sync_mask: u32,

    /// Master data ports.
    #[serde(default)]
    pub ports: Vec<PortCapability>,

    /// Slaves attached to this link.
    #[serde(default)]
    pub slaves: Vec<SlaveConfig>,
}

impl MasterConfig {
    /// Create a master with no ports or slaves.
    pub fn new(name: impl Into<String>, base_clk_freq: u32) -> Self {
        Self {
            name: name.into(),
            base_clk_freq,
            link_sync_mask: 0,
            ports: Vec::new(),
            slaves: Vec::new(),
        }
    }

    /// Set the link sync mask.
    pub fn with_link_sync_mask(mut self, mask: u32) -> Self {
        self.link_sync_mask = mask;
        self
    }

    /// Add a master data port.
    pub fn with_port(mut self, port: PortCapability) -> Self {
        self.ports.push(port);
        self
    }

    /// Add a slave.
    pub fn with_slave(mut self, slave: SlaveConfig) -> Self {
        self.slaves.push(slave);
        self
    }

    /// Capabilities to register with the bus manager.
    pub fn capability(&self) -> MasterCapability {
        let mut caps =
            MasterCapability::new(self.base_clk_freq).with_link_sync_mask(self.link_sync_mask);
        for port in &self.ports {
            caps = caps.with_port(port.clone());
        }
        caps
    }
}

/// One slave device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaveConfig {
    /// Name streams refer to.
    pub name: String,

    /// Device ID, written as six colon-separated hex bytes.
    #[serde(with = "dev_id_string")]
    pub dev_id: DevId,

    /// Capabilities registered once the slave enumerates.
    #[serde(default)]
    pub caps: SlaveCapability,
}

impl SlaveConfig {
    /// Create a slave with no data ports.
    pub fn new(name: impl Into<String>, dev_id: DevId) -> Self {
        Self {
            name: name.into(),
            dev_id,
            caps: SlaveCapability::new(),
        }
    }

    /// Set the capabilities.
    pub fn with_caps(mut self, caps: SlaveCapability) -> Self {
        self.caps = caps;
        self
    }
}

mod dev_id_string {
    use sdwire_core::DevId;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(id: &DevId, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DevId, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// Ports used by one endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortUse {
    /// Data port number.
    pub port: u8,
    /// Channel mask.
    pub ch_mask: u8,
}

impl PortUse {
    /// Create a port selection.
    pub const fn new(port: u8, ch_mask: u8) -> Self {
        Self { port, ch_mask }
    }

    /// The selection in the form the bus manager takes.
    pub const fn to_port_config(self) -> PortConfig {
        PortConfig::new(self.port, self.ch_mask)
    }
}

/// Master side of a stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterEndpoint {
    /// Master name.
    pub master: String,
    /// Ports used.
    #[serde(default)]
    pub ports: Vec<PortUse>,
}

/// Slave side of a stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaveEndpoint {
    /// Slave name.
    pub slave: String,
    /// Ports used.
    #[serde(default)]
    pub ports: Vec<PortUse>,
}

/// A stream to configure and start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamScenario {
    /// Scenario name.
    pub name: String,

    /// Tag sharing key; scenarios with the same key join one stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Sample rate in Hz.
    pub rate: u32,

    /// Channels per master endpoint.
    pub channels: u32,

    /// Bits per sample.
    pub bps: u32,

    /// Direction relative to the masters (`out` for playback).
    #[serde(default)]
    pub direction: Direction,

    /// Payload type.
    #[serde(default)]
    pub kind: StreamKind,

    /// Master endpoints, one per bus the stream spans.
    #[serde(default)]
    pub masters: Vec<MasterEndpoint>,

    /// Slave endpoints.
    #[serde(default)]
    pub slaves: Vec<SlaveEndpoint>,
}

impl StreamScenario {
    /// Create a stream with no endpoints.
    pub fn new(name: impl Into<String>, rate: u32, channels: u32, bps: u32) -> Self {
        Self {
            name: name.into(),
            key: None,
            rate,
            channels,
            bps,
            direction: Direction::Out,
            kind: StreamKind::Pcm,
            masters: Vec::new(),
            slaves: Vec::new(),
        }
    }

    /// Set the direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Add a master endpoint.
    pub fn with_master(mut self, master: impl Into<String>, ports: Vec<PortUse>) -> Self {
        self.masters.push(MasterEndpoint {
            master: master.into(),
            ports,
        });
        self
    }

    /// Add a slave endpoint.
    pub fn with_slave(mut self, slave: impl Into<String>, ports: Vec<PortUse>) -> Self {
        self.slaves.push(SlaveEndpoint {
            slave: slave.into(),
            ports,
        });
        self
    }

    /// Configuration of a master endpoint.
    pub fn master_config(&self) -> StreamConfig {
        StreamConfig::new(self.rate, self.channels, self.bps, self.direction).with_kind(self.kind)
    }

    /// Configuration of a slave endpoint; slaves see the opposite direction.
    pub fn slave_config(&self) -> StreamConfig {
        let direction = match self.direction {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        };
        StreamConfig::new(self.rate, self.channels, self.bps, direction).with_kind(self.kind)
    }
}

impl Topology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the core tunables.
    pub fn with_tuning(mut self, tuning: CoreConfig) -> Self {
        self.tuning = tuning;
        self
    }

    /// Add a master.
    pub fn with_master(mut self, master: MasterConfig) -> Self {
        self.masters.push(master);
        self
    }

    /// Add a stream.
    pub fn with_stream(mut self, stream: StreamScenario) -> Self {
        self.streams.push(stream);
        self
    }

    /// Load a topology from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read(path, e))?;
        let topology: Topology = toml::from_str(&content)?;
        Ok(topology)
    }

    /// Load a topology from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the topology to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::write(path, e))?;
        Ok(())
    }

    /// Convert the topology to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Look up a master by name.
    pub fn master(&self, name: &str) -> Option<&MasterConfig> {
        self.masters.iter().find(|m| m.name == name)
    }

    /// Look up a slave by name, with the master it is attached to.
    pub fn slave(&self, name: &str) -> Option<(&MasterConfig, &SlaveConfig)> {
        self.masters.iter().find_map(|m| {
            m.slaves
                .iter()
                .find(|s| s.name == name)
                .map(|s| (m, s))
        })
    }

    /// Look up a stream by name.
    pub fn stream(&self, name: &str) -> Option<&StreamScenario> {
        self.streams.iter().find(|s| s.name == name)
    }
}
