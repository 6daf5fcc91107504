//! Stream state transitions.
//!
//! Each transition works in three passes over the master runtimes it
//! affects: stage the new configuration into the inactive bank of every bus,
//! switch banks (one synchronized switch for link-synced buses), then finish
//! per-runtime work that needs the new bank live.
//!
//! A [`Transition`] is built by the manager with every stream on the affected
//! buses already locked, so runtimes of other streams can be reprogrammed
//! alongside the one being moved.

use crate::bank::Bank;
use crate::bus::{BankImage, Bus, BusId, BusState};
use crate::caps::{ChannelPrepare, PortCapability};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::regs::{BROADCAST, banked_port_reg, dpn, frame_ctrl, port_reg};
use crate::solver;
use crate::stream::{MasterRuntime, PortRuntime, Stream, StreamState, StreamTag};
use crate::transfer::{Completion, Msg, PrepareCh, TransferContext};
use parking_lot::MutexGuard;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub(crate) type StreamGuard<'a> = MutexGuard<'a, Stream>;

/// Which runtimes on a bus an operation looks at.
#[derive(Debug, Clone, Copy)]
enum Selection {
    /// Runtimes holding bandwidth, plus the configured runtime of one stream
    /// that is about to be prepared.
    Solver { including: Option<StreamTag> },
    /// Runtimes with channels running.
    Running,
}

impl Selection {
    fn contains(self, tag: StreamTag, rt: &MasterRuntime) -> bool {
        match self {
            Selection::Solver { including } => {
                rt.state.holds_bandwidth()
                    || (including == Some(tag)
                        && matches!(rt.state, StreamState::Config | StreamState::Unprepare))
            }
            Selection::Running => rt.state == StreamState::Enable,
        }
    }
}

fn select<'s>(
    streams: &'s [StreamGuard<'_>],
    bus: BusId,
    order: &[StreamTag],
    selection: Selection,
) -> Vec<&'s MasterRuntime> {
    let mut found: Vec<(usize, &'s MasterRuntime)> = Vec::new();
    for guard in streams {
        let stream: &'s Stream = guard;
        let tag = stream.tag();
        let Some(pos) = order.iter().position(|t| *t == tag) else {
            continue;
        };
        if let Some(rt) = stream.master(bus)
            && selection.contains(tag, rt)
        {
            found.push((pos, rt));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, rt)| rt).collect()
}

fn select_mut<'s>(
    streams: &'s mut [StreamGuard<'_>],
    bus: BusId,
    order: &[StreamTag],
    selection: Selection,
) -> Vec<&'s mut MasterRuntime> {
    let mut found: Vec<(usize, &'s mut MasterRuntime)> = Vec::new();
    for guard in streams.iter_mut() {
        let stream: &'s mut Stream = &mut **guard;
        let tag = stream.tag();
        let Some(pos) = order.iter().position(|t| *t == tag) else {
            continue;
        };
        if let Some(rt) = stream.master_mut(bus)
            && selection.contains(tag, rt)
        {
            found.push((pos, rt));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, rt)| rt).collect()
}

/// One lifecycle operation on one stream.
pub(crate) struct Transition<'a> {
    config: &'a CoreConfig,
    buses: HashMap<BusId, Arc<Bus>>,
    streams: Vec<StreamGuard<'a>>,
    current: usize,
}

impl<'a> Transition<'a> {
    pub(crate) fn new(
        config: &'a CoreConfig,
        buses: HashMap<BusId, Arc<Bus>>,
        streams: Vec<StreamGuard<'a>>,
        current: usize,
    ) -> Self {
        Self {
            config,
            buses,
            streams,
            current,
        }
    }

    fn stream(&self) -> &Stream {
        &self.streams[self.current]
    }

    fn stream_mut(&mut self) -> &mut Stream {
        &mut self.streams[self.current]
    }

    fn tag(&self) -> StreamTag {
        self.stream().tag()
    }

    fn bus(&self, id: BusId) -> Result<Arc<Bus>> {
        self.buses
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("{id} is not registered")))
    }

    fn runtime(&self, bus: BusId) -> Result<&MasterRuntime> {
        self.stream()
            .master(bus)
            .ok_or_else(|| Error::invalid(format!("{} has no runtime on {bus}", self.tag())))
    }

    fn set_runtime_state(&mut self, bus: BusId, state: StreamState) {
        if let Some(rt) = self.stream_mut().master_mut(bus) {
            rt.set_state(state);
        }
    }

    /// Buses whose runtime of the current stream is in one of `states`.
    fn targets(&self, states: &[StreamState]) -> Vec<BusId> {
        self.stream()
            .masters
            .iter()
            .filter(|m| states.contains(&m.state))
            .map(|m| m.bus)
            .collect()
    }

    fn any_in(&self, states: &[StreamState]) -> bool {
        self.stream()
            .masters
            .iter()
            .any(|m| states.contains(&m.state))
    }

    // ---- operations ----

    pub(crate) fn prepare(&mut self) -> Result<()> {
        let tag = self.tag();
        let targets = self.targets(&[StreamState::Config, StreamState::Unprepare]);
        if targets.is_empty() {
            if self.any_in(&[StreamState::Prepare, StreamState::Enable, StreamState::Disable]) {
                tracing::debug!(%tag, "prepare: already prepared");
                return Ok(());
            }
            return Err(Error::invalid(format!(
                "{tag} has no configured master runtime"
            )));
        }

        let mut staged = Vec::with_capacity(targets.len());
        for id in targets {
            let outcome = self
                .bus(id)
                .and_then(|bus| self.check_rates(&bus))
                .and_then(|()| {
                    let bw = self.runtime(id)?.params.bandwidth();
                    self.stage(id, bw, Some(tag), &mut staged)
                });
            if let Err(e) = outcome {
                rollback(staged);
                tracing::warn!(%tag, bus = %id, error = %e, "prepare: no bus configuration");
                return Err(e);
            }
        }
        for (bus, _) in &staged {
            if let Some(rt) = self.stream_mut().master_mut(bus.id()) {
                rt.stream_bw = rt.params.bandwidth();
            }
        }
        let staged = buses_of(staged);

        self.switch_banks(&staged)?;

        for bus in &staged {
            self.port_handshake(bus, true)?;
            self.set_runtime_state(bus.id(), StreamState::Prepare);
        }
        self.stream_mut().state = StreamState::Prepare;
        tracing::info!(%tag, buses = staged.len(), "stream prepared");
        Ok(())
    }

    pub(crate) fn enable(&mut self) -> Result<()> {
        let tag = self.tag();
        let targets = self.targets(&[StreamState::Prepare, StreamState::Disable]);
        if targets.is_empty() {
            if self.any_in(&[StreamState::Enable]) {
                tracing::debug!(%tag, "enable: already enabled");
                return Ok(());
            }
            return Err(Error::invalid(format!("{tag} is not prepared")));
        }

        let mut staged = Vec::with_capacity(targets.len());
        for id in targets {
            if let Err(e) = self.stage(id, 0, None, &mut staged) {
                rollback(staged);
                return Err(e);
            }
        }
        let staged = buses_of(staged);
        for bus in &staged {
            let bank = bus.lock_state().inactive_bank();
            set_channels(bus, self.runtime(bus.id())?, bank, true)?;
        }

        self.switch_banks(&staged)?;

        for bus in &staged {
            self.set_runtime_state(bus.id(), StreamState::Enable);
        }
        self.stream_mut().state = StreamState::Enable;
        tracing::info!(%tag, "stream enabled");
        Ok(())
    }

    pub(crate) fn disable(&mut self) -> Result<()> {
        let tag = self.tag();
        let targets = self.targets(&[StreamState::Enable]);
        if targets.is_empty() {
            if self.any_in(&[StreamState::Disable]) {
                tracing::debug!(%tag, "disable: already disabled");
                return Ok(());
            }
            return Err(Error::invalid(format!("{tag} is not enabled")));
        }

        // Out of the running set before staging, so the new bank leaves
        // these channels off.
        for id in &targets {
            self.set_runtime_state(*id, StreamState::Disable);
        }
        let mut staged = Vec::with_capacity(targets.len());
        for id in &targets {
            if let Err(e) = self.stage(*id, 0, None, &mut staged) {
                rollback(staged);
                for id in &targets {
                    self.set_runtime_state(*id, StreamState::Enable);
                }
                return Err(e);
            }
        }
        let staged = buses_of(staged);
        for bus in &staged {
            let bank = bus.lock_state().active_bank();
            set_channels(bus, self.runtime(bus.id())?, bank, false)?;
        }

        self.switch_banks(&staged)?;
        self.stream_mut().state = StreamState::Disable;
        tracing::info!(%tag, "stream disabled");
        Ok(())
    }

    pub(crate) fn unprepare(&mut self) -> Result<()> {
        let tag = self.tag();
        let targets = self.targets(&[StreamState::Disable]);
        if targets.is_empty() {
            if self.any_in(&[StreamState::Unprepare]) {
                tracing::debug!(%tag, "unprepare: already unprepared");
                return Ok(());
            }
            return Err(Error::invalid(format!("{tag} is not disabled")));
        }

        let mut staged = Vec::with_capacity(targets.len());
        for id in targets {
            let bus = self.bus(id)?;
            let bw = self.runtime(id)?.stream_bw;
            if bw > bus.lock_state().bandwidth {
                return Err(Error::invalid(format!(
                    "{tag}: BW calculation failed on {id}"
                )));
            }

            self.port_handshake(&bus, false)?;
            self.set_runtime_state(id, StreamState::Unprepare);
            if let Some(rt) = self.stream_mut().master_mut(id) {
                rt.stream_bw = 0;
            }

            let mut state = bus.lock_state();
            state.bandwidth -= bw;
            if state.bandwidth == 0 {
                state.reset_idle();
                tracing::debug!(bus = %id, "bus idle");
                continue;
            }
            let saved = state.clone();
            if let Err(e) = self.resolve(&bus, &mut state, None) {
                *state = saved;
                return Err(e);
            }
            self.program(&bus, &mut state, None)?;
            drop(state);
            staged.push(bus);
        }

        self.switch_banks(&staged)?;
        self.stream_mut().state = StreamState::Unprepare;
        tracing::info!(%tag, "stream unprepared");
        Ok(())
    }

    // ---- helpers ----

    fn check_rates(&self, bus: &Bus) -> Result<()> {
        let tag = self.tag();
        let rt = self.runtime(bus.id())?;
        let base = bus.caps().base_clk_freq;
        let rate = rt.params.rate;
        if rate == 0 {
            return Err(Error::invalid(format!("{tag}: sample rate is zero")));
        }
        if base % rate != 0 {
            return Err(Error::invalid(format!(
                "{tag}: asynchronous mode not supported ({rate} Hz on a {base} Hz base clock)"
            )));
        }
        if self.stream().params.rate != rate {
            return Err(Error::invalid(format!(
                "{tag}: sampling frequency mismatch ({} Hz stream, {rate} Hz runtime)",
                self.stream().params.rate
            )));
        }
        Ok(())
    }

    /// Add `extra_bw` to a bus, solve it and program its inactive bank.
    ///
    /// The bus state from before the change is pushed onto `staged` first,
    /// so a failure here or on a later bus can be undone with [`rollback`].
    fn stage(
        &mut self,
        id: BusId,
        extra_bw: u64,
        including: Option<StreamTag>,
        staged: &mut Vec<(Arc<Bus>, BusState)>,
    ) -> Result<()> {
        let bus = self.bus(id)?;
        let mut state = bus.lock_state();
        staged.push((Arc::clone(&bus), state.clone()));
        state.bandwidth += extra_bw;
        self.resolve(&bus, &mut state, including)?;
        self.program(&bus, &mut state, including)
    }

    /// Solve the bus and commit the result to `state` and the runtimes.
    fn resolve(
        &mut self,
        bus: &Bus,
        state: &mut BusState,
        including: Option<StreamTag>,
    ) -> Result<()> {
        let order = state.runtimes.clone();
        let mut runtimes = select_mut(
            &mut self.streams,
            bus.id(),
            &order,
            Selection::Solver { including },
        );
        let slave_ports = slave_port_caps(bus, &runtimes);
        let view: Vec<&MasterRuntime> = runtimes.iter().map(|rt| &**rt).collect();
        let solution = solver::solve(bus.caps().base_clk_freq, state, &view, &slave_ports)?;
        solution.apply(state, &mut runtimes);
        Ok(())
    }

    /// Write the solved configuration into the inactive bank.
    fn program(
        &self,
        bus: &Bus,
        state: &mut BusState,
        including: Option<StreamTag>,
    ) -> Result<()> {
        let bank = state.inactive_bank();
        let order = state.runtimes.clone();
        let runtimes = select(
            &self.streams,
            bus.id(),
            &order,
            Selection::Solver { including },
        );
        let ops = bus.ops();
        for rt in &runtimes {
            for slave in &rt.slaves {
                for port in &slave.ports {
                    program_slave_port(bus, slave.slave.dev_num, port, bank)?;
                }
            }
            for port in &rt.ports {
                bus.master_call(
                    "master port transport",
                    ops.set_port_transport_params(port.port_num, &port.transport, bank),
                )?;
                bus.master_call(
                    "master port params",
                    ops.set_port_params(port.port_num, &port.params, bank),
                )?;
            }
        }

        let frame = state
            .frame
            .ok_or_else(|| Error::invalid(format!("{} has no frame shape", bus.id())))?;
        let ssp = u32::try_from(state.system_interval).map_err(|_| {
            Error::invalid(format!(
                "system interval {} overflows",
                state.system_interval
            ))
        })?;
        bus.master_call("ssp interval", ops.set_ssp_interval(ssp, bank))?;
        bus.master_call("clock frequency", ops.set_clock_freq(state.clk_freq, bank))?;
        bus.master_call("frame shape", ops.set_frame_shape(frame, bank))?;
        *state.banks.inactive_mut() = BankImage {
            frame: Some(frame),
            clk_freq: state.clk_freq,
            ssp_interval: state.system_interval,
        };

        for rt in select(&self.streams, bus.id(), &order, Selection::Running) {
            set_channels(bus, rt, bank, true)?;
        }
        tracing::debug!(bus = %bus.id(), %bank, runtimes = runtimes.len(), frame = %frame, "programmed inactive bank");
        Ok(())
    }

    /// Switch every staged bus, unsynchronized buses first.
    fn switch_banks(&self, staged: &[Arc<Bus>]) -> Result<()> {
        let (synced, single): (Vec<&Arc<Bus>>, Vec<&Arc<Bus>>) =
            staged.iter().partition(|b| b.caps().is_link_synced());
        for bus in single {
            self.simple_switch(bus)?;
            self.disable_old_bank(bus)?;
        }
        if !synced.is_empty() {
            self.sync_switch(&synced)?;
            for bus in synced {
                self.disable_old_bank(bus)?;
            }
        }
        Ok(())
    }

    fn simple_switch(&self, bus: &Bus) -> Result<()> {
        let mut msgs = [framectrl_msg(bus)?];
        bus.transfer(&mut msgs, TransferContext::Blocking)?;
        let settle = self.config.bank_switch_settle();
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }
        let bank = bus.lock_state().banks.switch();
        tracing::debug!(bus = %bus.id(), %bank, "bank switched");
        Ok(())
    }

    fn sync_switch(&self, buses: &[&Arc<Bus>]) -> Result<()> {
        for bus in buses {
            bus.master_call("pre bank switch", bus.ops().pre_bank_switch())?;
        }
        let mut pending = Vec::with_capacity(buses.len());
        for bus in buses {
            let mut msg = framectrl_msg(bus)?;
            let done = Completion::new();
            bus.transfer_async(&mut msg, &done)?;
            pending.push((bus, done));
        }
        let deadline = Instant::now() + self.config.bank_switch_timeout();
        for (bus, done) in &pending {
            match done.wait_until(deadline) {
                None => {
                    tracing::error!(bus = %bus.id(), "synchronized bank switch timed out");
                    return Err(Error::timeout(format!("bank switch on {}", bus.id())));
                }
                Some(Err(e)) => {
                    return Err(Error::io(format!("bank switch on {}", bus.id()), e));
                }
                Some(Ok(())) => {}
            }
        }
        for bus in buses {
            bus.lock_state().banks.switch();
            bus.master_call("post bank switch", bus.ops().post_bank_switch())?;
        }
        tracing::debug!(buses = buses.len(), "synchronized bank switch");
        Ok(())
    }

    /// Stop running channels in the bank that just went inactive.
    fn disable_old_bank(&self, bus: &Bus) -> Result<()> {
        let (bank, order) = {
            let state = bus.lock_state();
            (state.inactive_bank(), state.runtimes.clone())
        };
        for rt in select(&self.streams, bus.id(), &order, Selection::Running) {
            set_channels(bus, rt, bank, false)?;
        }
        Ok(())
    }

    /// Run the prepare or unprepare handshake on every port of the current
    /// stream's runtime on `bus`.
    fn port_handshake(&self, bus: &Bus, prepare: bool) -> Result<()> {
        let bank = bus.lock_state().active_bank();
        let settle = self.config.port_prepare_settle();
        let rt = self.runtime(bus.id())?;
        for slave in &rt.slaves {
            let id = slave.slave;
            let caps = bus.slave_caps(id.dev_num);
            let driver = bus.slave_driver(id.dev_num);
            for port in &slave.ports {
                let mode = caps
                    .as_ref()
                    .and_then(|c| c.port(port.port_num))
                    .map_or(ChannelPrepare::Normal, |p| p.prepare);
                if let Some(driver) = &driver {
                    if prepare {
                        driver.pre_port_prepare(id, port.port_num, port.ch_mask, bank);
                    } else {
                        driver.pre_port_unprepare(id, port.port_num, port.ch_mask, bank);
                    }
                }
                if mode == ChannelPrepare::Normal {
                    if prepare {
                        prepare_slave_port(bus, id.dev_num, port, settle)?;
                    } else {
                        unprepare_slave_port(bus, id.dev_num, port)?;
                    }
                }
                if let Some(driver) = &driver {
                    if prepare {
                        driver.post_port_prepare(id, port.port_num, port.ch_mask, bank);
                    } else {
                        driver.post_port_unprepare(id, port.port_num, port.ch_mask, bank);
                    }
                }
            }
        }
        let ops = bus.ops();
        for port in &rt.ports {
            let ch = PrepareCh {
                port_num: port.port_num,
                ch_mask: port.ch_mask,
                prepare,
                bank,
            };
            bus.master_call("master port prepare", ops.port_prepare_ch_pre(&ch))?;
            bus.master_call("master port prepare", ops.port_prepare_ch(&ch))?;
            bus.master_call("master port prepare", ops.port_prepare_ch_post(&ch))?;
        }
        Ok(())
    }
}

/// Put back the bus states saved by [`Transition::stage`].
fn rollback(staged: Vec<(Arc<Bus>, BusState)>) {
    for (bus, saved) in staged.into_iter().rev() {
        tracing::debug!(bus = %bus.id(), bandwidth = saved.bandwidth, "bus state rolled back");
        *bus.lock_state() = saved;
    }
}

fn buses_of(staged: Vec<(Arc<Bus>, BusState)>) -> Vec<Arc<Bus>> {
    staged.into_iter().map(|(bus, _)| bus).collect()
}

fn slave_port_caps(bus: &Bus, runtimes: &[&mut MasterRuntime]) -> Vec<PortCapability> {
    let mut ports = Vec::new();
    for rt in runtimes {
        for slave in &rt.slaves {
            let Some(caps) = bus.slave_caps(slave.slave.dev_num) else {
                continue;
            };
            ports.extend(
                slave
                    .ports
                    .iter()
                    .filter_map(|p| caps.port(p.port_num).cloned()),
            );
        }
    }
    ports
}

fn framectrl_msg(bus: &Bus) -> Result<Msg> {
    let state = bus.lock_state();
    let frame = state
        .frame
        .ok_or_else(|| Error::invalid(format!("{} has no frame shape", bus.id())))?;
    let value = frame
        .encode()
        .ok_or_else(|| Error::invalid(format!("frame {frame} has no encoding")))?;
    Ok(Msg::write(BROADCAST, frame_ctrl(state.inactive_bank()), [value]).with_ssp_tag())
}

/// Write one slave port's transport and control registers into `bank`.
fn program_slave_port(bus: &Bus, dev_num: u8, port: &PortRuntime, bank: Bank) -> Result<()> {
    let ctrl_addr = port_reg(port.port_num, dpn::PORTCTRL);
    let portctrl = bus.read_byte(dev_num, ctrl_addr)?;
    let start = if port.transport.block_group_control_valid {
        dpn::BLOCKCTRL2
    } else {
        dpn::SAMPLECTRL1
    };
    let params = port.params;
    let word = u8::try_from(params.word_length.saturating_sub(1))
        .map_err(|_| Error::invalid(format!("word length {} too large", params.word_length)))?;
    let mut msgs = [
        Msg::write(
            dev_num,
            banked_port_reg(port.port_num, start, bank),
            port.transport.register_bytes(),
        ),
        Msg::write(
            dev_num,
            ctrl_addr,
            [portctrl | params.flow_mode | (params.data_mode << 2), word],
        ),
    ];
    bus.transfer(&mut msgs, TransferContext::Blocking)?;
    Ok(())
}

/// Enable or disable a runtime's channels in `bank`.
fn set_channels(bus: &Bus, rt: &MasterRuntime, bank: Bank, activate: bool) -> Result<()> {
    for slave in &rt.slaves {
        let dev = slave.slave.dev_num;
        for port in &slave.ports {
            let addr = banked_port_reg(port.port_num, dpn::CHANNELEN, bank);
            let current = bus.read_byte(dev, addr)?;
            let value = if activate {
                current | port.ch_mask
            } else {
                current & !port.ch_mask
            };
            bus.write_byte(dev, addr, value)?;
        }
    }
    let ops = bus.ops();
    for port in &rt.ports {
        bus.master_call(
            "master channel enable",
            ops.port_activate_ch(port.port_num, port.ch_mask, activate, bank),
        )?;
    }
    Ok(())
}

fn prepare_slave_port(
    bus: &Bus,
    dev_num: u8,
    port: &PortRuntime,
    settle: std::time::Duration,
) -> Result<()> {
    let ctrl_addr = port_reg(port.port_num, dpn::PREPARECTRL);
    let status_addr = port_reg(port.port_num, dpn::PREPARESTATUS);
    let mut msgs = [
        Msg::read(dev_num, ctrl_addr, 1),
        Msg::read(dev_num, status_addr, 1),
    ];
    bus.transfer(&mut msgs, TransferContext::Blocking)?;
    bus.write_byte(dev_num, ctrl_addr, msgs[0].buf[0] | port.ch_mask)?;
    if !settle.is_zero() {
        std::thread::sleep(settle);
    }
    let status = bus.read_byte(dev_num, status_addr)?;
    if status & port.ch_mask != port.ch_mask {
        tracing::warn!(
            bus = %bus.id(),
            dev = dev_num,
            port = port.port_num,
            status,
            "port not ready after prepare"
        );
    }
    Ok(())
}

fn unprepare_slave_port(bus: &Bus, dev_num: u8, port: &PortRuntime) -> Result<()> {
    let ctrl_addr = port_reg(port.port_num, dpn::PREPARECTRL);
    let ctrl = bus.read_byte(dev_num, ctrl_addr)?;
    bus.write_byte(dev_num, ctrl_addr, ctrl & !port.ch_mask)
}
