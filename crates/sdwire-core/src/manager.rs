//! The bus manager: public entry point for buses, slaves and streams.

use crate::bus::{Bus, BusId, BusState, ClockStopMode};
use crate::caps::{MasterCapability, SlaveCapability};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::lifecycle::{StreamGuard, Transition};
use crate::registry::{BusRegistry, Released, StreamHandle, StreamRegistry};
use crate::slave::{DevId, SlaveDriver, SlaveId, SlaveInfo, SlaveStatus, StatusReport};
use crate::status;
use crate::stream::{
    Endpoint, PortConfig, PortRuntime, SlaveRuntime, Stream, StreamConfig, StreamState,
    StreamTag,
};
use crate::bra::BraBlock;
use crate::transfer::{MasterOps, Msg, TransferContext};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Owns every bus and stream and serializes lifecycle operations.
///
/// Lifecycle calls (`prepare`, `enable`, `disable`, `unprepare`) take a
/// manager-wide lock and then every stream on the buses involved, so the
/// solver always sees a consistent set of runtimes. Configuration calls only
/// lock the stream they touch.
pub struct BusManager {
    config: CoreConfig,
    core_lock: Mutex<()>,
    streams: StreamRegistry,
    buses: BusRegistry,
}

impl Default for BusManager {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl BusManager {
    /// Create a manager with no buses.
    pub fn new(config: CoreConfig) -> Self {
        Self {
            streams: StreamRegistry::new(config.num_stream_tags),
            config,
            core_lock: Mutex::new(()),
            buses: BusRegistry::new(),
        }
    }

    /// Tunables in use.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ---- buses ----

    /// Register a bus controller and start its status worker.
    pub fn add_master(&self, caps: MasterCapability, ops: Arc<dyn MasterOps>) -> Result<BusId> {
        caps.validate()?;
        let id = self.buses.next_id();
        let bus = Arc::new(Bus::new(id, caps, ops, &self.config));
        status::spawn_worker(&bus)?;
        tracing::info!(
            bus = %id,
            base_clk_freq = bus.caps().base_clk_freq,
            link_sync_mask = bus.caps().link_sync_mask,
            "bus registered"
        );
        self.buses.insert(bus);
        Ok(id)
    }

    /// Unregister a bus. Fails while streams have runtimes on it.
    pub fn remove_master(&self, id: BusId) -> Result<()> {
        let _core = self.core_lock.lock();
        let bus = self.bus(id)?;
        let attached = bus.lock_state().runtimes.len();
        if attached > 0 {
            return Err(Error::busy(format!("{id}: {attached} stream(s) attached")));
        }
        if let Some(bus) = self.buses.remove(id) {
            bus.shutdown();
        }
        tracing::info!(bus = %id, "bus removed");
        Ok(())
    }

    /// Look up a bus.
    pub fn bus(&self, id: BusId) -> Result<Arc<Bus>> {
        self.buses
            .get(id)
            .ok_or_else(|| Error::invalid(format!("{id} is not registered")))
    }

    /// Ids of all buses.
    pub fn bus_ids(&self) -> Vec<BusId> {
        self.buses.ids()
    }

    /// Snapshot of a bus's configuration.
    pub fn bus_state(&self, id: BusId) -> Result<BusState> {
        Ok(self.bus(id)?.state())
    }

    /// Run register transfers on a bus.
    pub fn transfer(&self, id: BusId, msgs: &mut [Msg], ctx: TransferContext) -> Result<usize> {
        self.bus(id)?.transfer(msgs, ctx)
    }

    /// Stop the bus clock.
    pub fn stop_clock(&self, id: BusId, mode: ClockStopMode) -> Result<()> {
        let _core = self.core_lock.lock();
        self.bus(id)?.stop_clock(mode)
    }

    /// Run a bulk register transfer. Fails with [`Error::Busy`] while streams
    /// are attached to the bus.
    pub fn bra_transfer(&self, id: BusId, block: &mut BraBlock) -> Result<()> {
        let _core = self.core_lock.lock();
        self.bus(id)?.bra_transfer(block)
    }

    // ---- slaves ----

    /// Queue a status report from the controller of `id`.
    pub fn update_slave_status(&self, id: BusId, report: StatusReport) -> Result<()> {
        self.bus(id)?.update_slave_status(report)
    }

    /// Wait until `dev_id` is enumerated on `id` and return its address.
    pub fn wait_for_slave_enumeration(&self, id: BusId, dev_id: &DevId) -> Result<SlaveId> {
        let dev_num = self.bus(id)?.wait_for_enumeration(dev_id)?;
        Ok(SlaveId::new(id, dev_num))
    }

    /// Attach capabilities to an enumerated slave.
    ///
    /// Interrupt masks are reprogrammed right away when the slave is attached.
    pub fn register_slave_capabilities(&self, slave: SlaveId, caps: SlaveCapability) -> Result<()> {
        caps.validate()?;
        let bus = self.bus(slave.bus)?;
        bus.set_slave_caps(slave.dev_num, caps)?;
        let present = bus
            .slave(slave.dev_num)
            .is_some_and(|s| s.status != SlaveStatus::NotPresent);
        if present {
            bus.program_interrupts(slave.dev_num)?;
        }
        tracing::debug!(%slave, "slave capabilities registered");
        Ok(())
    }

    /// Attach a driver to an enumerated slave.
    pub fn bind_slave_driver(&self, slave: SlaveId, driver: Arc<dyn SlaveDriver>) -> Result<()> {
        self.bus(slave.bus)?.set_slave_driver(slave.dev_num, driver)
    }

    /// Snapshot of one slave.
    pub fn slave(&self, slave: SlaveId) -> Result<SlaveInfo> {
        self.bus(slave.bus)?
            .slave(slave.dev_num)
            .ok_or_else(|| Error::invalid(format!("{slave} not enumerated")))
    }

    // ---- stream tags ----

    /// Allocate a stream tag. Callers passing the same key share one tag.
    pub fn alloc_stream_tag(&self, key: Option<&str>) -> Result<StreamTag> {
        self.streams.alloc(key)
    }

    /// Drop one reference on a tag. The last reference frees the stream and
    /// detaches it from every bus, returning any bandwidth it still held.
    pub fn release_stream_tag(&self, tag: StreamTag) {
        let _core = self.core_lock.lock();
        match self.streams.release(tag) {
            Released::Unknown => tracing::warn!(%tag, "release of unknown stream tag"),
            Released::Shared(refs) => tracing::debug!(%tag, refs, "stream tag still shared"),
            Released::Freed(handle) => self.detach(tag, &handle),
        }
    }

    fn detach(&self, tag: StreamTag, handle: &StreamHandle) {
        let stream = handle.lock();
        for rt in &stream.masters {
            let Some(bus) = self.buses.get(rt.bus) else {
                continue;
            };
            {
                let mut state = bus.lock_state();
                state.runtimes.retain(|t| *t != tag);
                if rt.state.holds_bandwidth() {
                    tracing::warn!(
                        %tag,
                        bus = %rt.bus,
                        state = %rt.state,
                        bandwidth = rt.stream_bw,
                        "stream freed while active"
                    );
                    state.bandwidth = state.bandwidth.saturating_sub(rt.stream_bw);
                    if state.bandwidth == 0 {
                        state.reset_idle();
                        tracing::debug!(bus = %rt.bus, "bus idle");
                    }
                }
            }
            if rt.state != StreamState::Init {
                bus.release();
            }
            for slave in &rt.slaves {
                bus.slave_usage(slave.slave.dev_num, -1);
            }
        }
        tracing::debug!(%tag, "stream tag freed");
    }

    /// Holders of a tag.
    pub fn stream_ref_count(&self, tag: StreamTag) -> Option<u32> {
        self.streams.ref_count(tag)
    }

    /// Snapshot of a stream.
    pub fn stream(&self, tag: StreamTag) -> Result<Stream> {
        Ok(self.handle(tag)?.lock().clone())
    }

    fn handle(&self, tag: StreamTag) -> Result<StreamHandle> {
        self.streams
            .get(tag)
            .ok_or_else(|| Error::invalid(format!("{tag} is not allocated")))
    }

    // ---- configuration ----

    fn endpoint_bus(&self, endpoint: Endpoint) -> Result<Arc<Bus>> {
        let bus = self.bus(endpoint.bus())?;
        if let Endpoint::Slave(slave) = endpoint
            && !bus.is_assigned(slave.dev_num)
        {
            return Err(Error::invalid(format!("{slave} not enumerated")));
        }
        Ok(bus)
    }

    /// Add an endpoint to a stream.
    ///
    /// A slave endpoint creates the master runtime for its bus if none exists
    /// yet; that runtime stays in `Init` until the master endpoint itself is
    /// configured.
    pub fn config_stream(
        &self,
        endpoint: Endpoint,
        config: &StreamConfig,
        tag: StreamTag,
    ) -> Result<()> {
        if config.channel_count == 0 || config.bps == 0 {
            return Err(Error::invalid(format!(
                "{tag}: channel count and sample width must be non-zero"
            )));
        }
        let handle = self.handle(tag)?;
        let bus = self.endpoint_bus(endpoint)?;
        let mut stream = handle.lock();
        stream.accumulate(config)?;

        let (rt, created) = stream.master_or_insert(bus.id());
        match endpoint {
            Endpoint::Master(_) => {
                if rt.state == StreamState::Init {
                    bus.acquire();
                }
                rt.direction = config.direction;
                rt.params = config.params();
                if !rt.state.holds_bandwidth() {
                    rt.state = StreamState::Config;
                }
            }
            Endpoint::Slave(slave) => {
                rt.slaves.push(SlaveRuntime::new(slave, config));
                bus.slave_usage(slave.dev_num, 1);
            }
        }
        if stream.state == StreamState::Init {
            stream.state = StreamState::Config;
        }
        drop(stream);

        if created {
            bus.lock_state().runtimes.push(tag);
        }
        tracing::debug!(
            %tag,
            %endpoint,
            rate = config.rate,
            channels = config.channel_count,
            bps = config.bps,
            direction = ?config.direction,
            "stream endpoint configured"
        );
        Ok(())
    }

    /// Attach ports to a configured endpoint.
    pub fn config_port(&self, endpoint: Endpoint, ports: &[PortConfig], tag: StreamTag) -> Result<()> {
        let handle = self.handle(tag)?;
        let bus = self.endpoint_bus(endpoint)?;
        if let Some(port) = ports.iter().find(|p| p.ch_mask == 0) {
            return Err(Error::invalid(format!(
                "{tag}: port {} has an empty channel mask",
                port.port_num
            )));
        }
        let mut stream = handle.lock();
        let rt = stream
            .master_mut(bus.id())
            .ok_or_else(|| Error::invalid(format!("{endpoint} not configured for {tag}")))?;

        match endpoint {
            Endpoint::Master(_) => {
                if rt.state == StreamState::Init {
                    return Err(Error::invalid(format!(
                        "{endpoint} not configured for {tag}"
                    )));
                }
                for port in ports {
                    let cap = bus.caps().port(port.port_num).ok_or_else(|| {
                        Error::invalid(format!(
                            "{endpoint}: port {} has no capability entry",
                            port.port_num
                        ))
                    })?;
                    cap.check_format(&rt.params)?;
                }
                rt.ports
                    .extend(ports.iter().map(|p| PortRuntime::new(p.port_num, p.ch_mask)));
            }
            Endpoint::Slave(slave) => {
                let caps = bus.slave_caps(slave.dev_num).ok_or_else(|| {
                    Error::invalid(format!("{slave}: capabilities not registered"))
                })?;
                let srt = rt
                    .slaves
                    .iter_mut()
                    .rev()
                    .find(|s| s.slave == slave)
                    .ok_or_else(|| Error::invalid(format!("{endpoint} not configured for {tag}")))?;
                for port in ports {
                    let cap = caps.port(port.port_num).ok_or_else(|| {
                        Error::invalid(format!(
                            "{endpoint}: port {} has no capability entry",
                            port.port_num
                        ))
                    })?;
                    cap.check_stream(&srt.params)?;
                }
                srt.ports
                    .extend(ports.iter().map(|p| PortRuntime::new(p.port_num, p.ch_mask)));
            }
        }
        tracing::debug!(%tag, %endpoint, ports = ports.len(), "ports configured");
        Ok(())
    }

    /// Remove an endpoint from a stream.
    ///
    /// Releasing a master drops its runtime together with the slaves on that
    /// bus. Runtimes still holding bandwidth must be unprepared first.
    pub fn release_stream(&self, endpoint: Endpoint, tag: StreamTag) -> Result<()> {
        let handle = self.handle(tag)?;
        let bus = self.bus(endpoint.bus())?;
        let mut stream = handle.lock();
        let idx = stream
            .masters
            .iter()
            .position(|m| m.bus == bus.id())
            .ok_or_else(|| Error::invalid(format!("{endpoint} not configured for {tag}")))?;
        if stream.masters[idx].state.holds_bandwidth() {
            return Err(Error::invalid(format!(
                "{tag}: runtime on {} is {}, unprepare first",
                bus.id(),
                stream.masters[idx].state
            )));
        }

        let detach = match endpoint {
            Endpoint::Master(_) => {
                let rt = stream.masters.remove(idx);
                if rt.state != StreamState::Init {
                    stream.drop_ref(rt.direction);
                    bus.release();
                }
                for slave in &rt.slaves {
                    stream.drop_ref(slave.direction);
                    bus.slave_usage(slave.slave.dev_num, -1);
                }
                true
            }
            Endpoint::Slave(slave) => {
                let removed: Vec<SlaveRuntime> = {
                    let rt = &mut stream.masters[idx];
                    let (gone, kept) = std::mem::take(&mut rt.slaves)
                        .into_iter()
                        .partition(|s| s.slave == slave);
                    rt.slaves = kept;
                    gone
                };
                if removed.is_empty() {
                    return Err(Error::invalid(format!("{endpoint} not configured for {tag}")));
                }
                for srt in &removed {
                    stream.drop_ref(srt.direction);
                    bus.slave_usage(slave.dev_num, -1);
                }
                let orphaned = {
                    let rt = &stream.masters[idx];
                    rt.state == StreamState::Init && rt.slaves.is_empty()
                };
                if orphaned {
                    stream.masters.remove(idx);
                }
                orphaned
            }
        };
        drop(stream);

        if detach {
            bus.lock_state().runtimes.retain(|t| *t != tag);
        }
        tracing::debug!(%tag, %endpoint, "stream endpoint released");
        Ok(())
    }

    // ---- lifecycle ----

    /// Commit bandwidth for a configured stream and prepare its ports.
    pub fn prepare(&self, tag: StreamTag) -> Result<()> {
        self.transition(tag, |t| t.prepare())
    }

    /// Start a prepared stream.
    pub fn enable(&self, tag: StreamTag) -> Result<()> {
        self.transition(tag, |t| t.enable())
    }

    /// Stop a running stream, keeping its bandwidth.
    pub fn disable(&self, tag: StreamTag) -> Result<()> {
        self.transition(tag, |t| t.disable())
    }

    /// Release a disabled stream's bandwidth.
    pub fn unprepare(&self, tag: StreamTag) -> Result<()> {
        self.transition(tag, |t| t.unprepare())
    }

    /// Prepare, and optionally enable, under one lock acquisition.
    pub fn prepare_and_enable(&self, tag: StreamTag, enable: bool) -> Result<()> {
        self.transition(tag, |t| {
            t.prepare()?;
            if enable {
                t.enable()?;
            }
            Ok(())
        })
    }

    /// Disable, and optionally unprepare, under one lock acquisition.
    pub fn disable_and_unprepare(&self, tag: StreamTag, unprepare: bool) -> Result<()> {
        self.transition(tag, |t| {
            t.disable()?;
            if unprepare {
                t.unprepare()?;
            }
            Ok(())
        })
    }

    /// Lock every stream on the buses `tag` touches and run `op`.
    fn transition<F>(&self, tag: StreamTag, op: F) -> Result<()>
    where
        F: FnOnce(&mut Transition<'_>) -> Result<()>,
    {
        let _core = self.core_lock.lock();
        let handle = self.handle(tag)?;
        loop {
            let bus_ids: Vec<_> = handle.lock().masters.iter().map(|m| m.bus).collect();
            let mut buses = HashMap::with_capacity(bus_ids.len());
            let mut tags = BTreeSet::from([tag]);
            for id in &bus_ids {
                let bus = self.bus(*id)?;
                tags.extend(bus.lock_state().runtimes.iter().copied());
                buses.insert(*id, bus);
            }

            let handles: Vec<StreamHandle> =
                tags.iter().filter_map(|t| self.streams.get(*t)).collect();
            let guards: Vec<StreamGuard<'_>> = handles.iter().map(|h| h.lock()).collect();
            let Some(current) = guards.iter().position(|g| g.tag() == tag) else {
                return Err(Error::invalid(format!("{tag} is not allocated")));
            };
            let unchanged = guards[current]
                .masters
                .iter()
                .map(|m| m.bus)
                .eq(bus_ids.iter().copied());
            if !unchanged {
                tracing::trace!(%tag, "bus set changed while locking, retrying");
                continue;
            }

            let mut transition = Transition::new(&self.config, buses, guards, current);
            return op(&mut transition);
        }
    }
}

impl Drop for BusManager {
    fn drop(&mut self) {
        for bus in self.buses.drain() {
            bus.shutdown();
        }
    }
}
