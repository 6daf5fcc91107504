//! Shared CLI helpers used across multiple commands.

use anyhow::Context;
use sdwire_config::{PortUse, Topology, validate_topology};
use sdwire_core::{
    BusId, BusManager, Endpoint, PortConfig, SimController, SlaveId, SlaveStatus, StatusReport,
    StreamTag,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Load a topology file and validate it.
pub fn load_topology(path: &Path) -> anyhow::Result<Topology> {
    let topology = Topology::load(path)?;
    validate_topology(&topology)?;
    tracing::debug!(
        path = %path.display(),
        masters = topology.masters.len(),
        streams = topology.streams.len(),
        "topology loaded"
    );
    Ok(topology)
}

/// A topology brought up on simulated links.
pub struct Board {
    /// The bus manager driving every link.
    pub manager: BusManager,
    /// Master names and their buses, in registration order.
    pub buses: Vec<(String, BusId)>,
    /// Enumerated slaves by name.
    pub slaves: HashMap<String, SlaveId>,
    /// Stream names and their tags, in topology order.
    pub streams: Vec<(String, StreamTag)>,
}

impl Board {
    /// Register every master, enumerate its slaves and configure every stream.
    pub fn bring_up(topology: &Topology) -> anyhow::Result<Self> {
        let manager = BusManager::new(topology.tuning.clone());
        let mut buses = Vec::new();
        let mut slaves = HashMap::new();

        for master in &topology.masters {
            let mut sim = SimController::new();
            for slave in &master.slaves {
                sim = sim.with_slave(slave.dev_id);
            }
            let bus = manager
                .add_master(master.capability(), Arc::new(sim))
                .with_context(|| format!("registering master '{}'", master.name))?;
            tracing::info!(master = %master.name, %bus, "master registered");

            if !master.slaves.is_empty() {
                manager.update_slave_status(
                    bus,
                    StatusReport::new().with(0, SlaveStatus::Attached),
                )?;
            }
            for slave in &master.slaves {
                let id = manager
                    .wait_for_slave_enumeration(bus, &slave.dev_id)
                    .with_context(|| format!("enumerating slave '{}'", slave.name))?;
                manager.register_slave_capabilities(id, slave.caps.clone())?;
                tracing::info!(slave = %slave.name, dev_id = %slave.dev_id, %id, "slave enumerated");
                slaves.insert(slave.name.clone(), id);
            }
            buses.push((master.name.clone(), bus));
        }

        let mut board = Self {
            manager,
            buses,
            slaves,
            streams: Vec::new(),
        };
        for scenario in &topology.streams {
            let tag = board
                .manager
                .alloc_stream_tag(scenario.key.as_deref())
                .with_context(|| format!("allocating a tag for stream '{}'", scenario.name))?;

            for endpoint in &scenario.masters {
                let bus = board.bus(&endpoint.master)?;
                let endpoint_ref = Endpoint::Master(bus);
                board
                    .manager
                    .config_stream(endpoint_ref, &scenario.master_config(), tag)
                    .and_then(|()| {
                        board
                            .manager
                            .config_port(endpoint_ref, &port_configs(&endpoint.ports), tag)
                    })
                    .with_context(|| {
                        format!(
                            "configuring stream '{}' on master '{}'",
                            scenario.name, endpoint.master
                        )
                    })?;
            }
            for endpoint in &scenario.slaves {
                let slave = board.slave(&endpoint.slave)?;
                let endpoint_ref = Endpoint::Slave(slave);
                board
                    .manager
                    .config_stream(endpoint_ref, &scenario.slave_config(), tag)
                    .and_then(|()| {
                        board
                            .manager
                            .config_port(endpoint_ref, &port_configs(&endpoint.ports), tag)
                    })
                    .with_context(|| {
                        format!(
                            "configuring stream '{}' on slave '{}'",
                            scenario.name, endpoint.slave
                        )
                    })?;
            }
            tracing::debug!(stream = %scenario.name, %tag, "stream configured");
            board.streams.push((scenario.name.clone(), tag));
        }

        Ok(board)
    }

    /// Prepare and optionally enable every stream, once per tag.
    pub fn start(&self, enable: bool) -> anyhow::Result<()> {
        let mut started = Vec::new();
        for (name, tag) in &self.streams {
            if started.contains(tag) {
                continue;
            }
            self.manager
                .prepare_and_enable(*tag, enable)
                .with_context(|| format!("starting stream '{name}'"))?;
            tracing::info!(stream = %name, %tag, enable, "stream started");
            started.push(*tag);
        }
        Ok(())
    }

    /// Disable and unprepare every stream, free the tags and check that
    /// every bus went back to idle.
    pub fn stop(&self) -> anyhow::Result<()> {
        let mut stopped = Vec::new();
        for (name, tag) in &self.streams {
            if !stopped.contains(tag) {
                self.manager
                    .disable_and_unprepare(*tag, true)
                    .with_context(|| format!("stopping stream '{name}'"))?;
                tracing::info!(stream = %name, %tag, "stream stopped");
                stopped.push(*tag);
            }
            self.manager.release_stream_tag(*tag);
        }

        for (name, bus) in &self.buses {
            let state = self.manager.bus_state(*bus)?;
            if state.bandwidth != 0 || state.frame.is_some() {
                anyhow::bail!(
                    "master '{name}' still carries {} bit/s after teardown",
                    state.bandwidth
                );
            }
        }
        Ok(())
    }

    fn bus(&self, name: &str) -> anyhow::Result<BusId> {
        self.buses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bus)| *bus)
            .with_context(|| format!("unknown master '{name}'"))
    }

    fn slave(&self, name: &str) -> anyhow::Result<SlaveId> {
        self.slaves
            .get(name)
            .copied()
            .with_context(|| format!("unknown slave '{name}'"))
    }
}

fn port_configs(ports: &[PortUse]) -> Vec<PortConfig> {
    ports.iter().map(|p| p.to_port_config()).collect()
}
