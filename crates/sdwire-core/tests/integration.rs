//! Integration tests for sdwire-core.
//!
//! These tests drive the bus manager end to end against the simulated
//! controller: enumeration, stream configuration, the lifecycle with its
//! bank switches, and the register images left behind on the slaves.

use parking_lot::Mutex;
use sdwire_core::regs::{BROADCAST, banked_port_reg, dpn, frame_ctrl, port_reg, scp};
use sdwire_core::{
    AudioMode, Bank, BraBlock, BusId, BusManager, ChannelPrepare, ClockStopMode, CoreConfig, DevId,
    Direction, Endpoint, Error, FrameShape, ImplDefStatus, MasterCall, MasterCapability, Msg,
    PortCapability, PortConfig, PrepareCh, SimController, SlaveCapability, SlaveDriver, SlaveId,
    SlaveStatus, StatusReport, StreamConfig, StreamState, StreamTag, Support, TransferContext,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BASE_CLK: u32 = 24_576_000;
const CODEC: DevId = DevId([0x00, 0x30, 0x02, 0x5d, 0x07, 0x11]);
const AMP: DevId = DevId([0x00, 0x30, 0x01, 0x5d, 0x13, 0x08]);

struct Rig {
    manager: BusManager,
    sim: Arc<SimController>,
    bus: BusId,
}

fn master_caps() -> MasterCapability {
    MasterCapability::new(BASE_CLK)
        .with_port(PortCapability::new(1))
        .with_port(PortCapability::new(2))
}

fn rig_with(config: CoreConfig, sim: SimController) -> Rig {
    let manager = BusManager::new(config);
    let sim = Arc::new(sim);
    let bus = manager
        .add_master(master_caps(), sim.clone())
        .expect("should register bus");
    Rig { manager, sim, bus }
}

fn rig() -> Rig {
    rig_with(CoreConfig::instant(), SimController::new().with_slave(CODEC))
}

/// Report a device at the unenumerated address and wait for its number.
fn enumerate(rig: &Rig, dev_id: &DevId) -> SlaveId {
    rig.manager
        .update_slave_status(rig.bus, StatusReport::new().with(0, SlaveStatus::Attached))
        .expect("status worker should accept report");
    rig.manager
        .wait_for_slave_enumeration(rig.bus, dev_id)
        .expect("slave should enumerate")
}

fn attach_codec(rig: &Rig, port: PortCapability) -> SlaveId {
    let slave = enumerate(rig, &CODEC);
    let caps = SlaveCapability::new()
        .with_port(port)
        .with_port(PortCapability::new(2));
    rig.manager
        .register_slave_capabilities(slave, caps)
        .expect("should register capabilities");
    slave
}

/// Configure a stereo 16-bit playback stream from master `port` to the same
/// slave port.
fn configure_playback(rig: &Rig, tag: StreamTag, slave: SlaveId, rate: u32, port: u8) {
    let m = &rig.manager;
    let out = StreamConfig::new(rate, 2, 16, Direction::Out);
    m.config_stream(Endpoint::Master(rig.bus), &out, tag)
        .expect("master endpoint");
    m.config_port(Endpoint::Master(rig.bus), &[PortConfig::new(port, 0x3)], tag)
        .expect("master ports");
    let sink = StreamConfig::new(rate, 2, 16, Direction::In);
    m.config_stream(Endpoint::Slave(slave), &sink, tag)
        .expect("slave endpoint");
    m.config_port(Endpoint::Slave(slave), &[PortConfig::new(port, 0x3)], tag)
        .expect("slave ports");
}

/// Poll until `cond` holds or two seconds pass.
fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[derive(Default)]
struct RecordingDriver {
    events: Mutex<Vec<String>>,
}

impl SlaveDriver for RecordingDriver {
    fn pre_port_prepare(&self, _slave: SlaveId, port: u8, ch_mask: u8, _bank: Bank) {
        self.events.lock().push(format!("pre_prepare {port} {ch_mask:#x}"));
    }

    fn post_port_prepare(&self, _slave: SlaveId, port: u8, ch_mask: u8, _bank: Bank) {
        self.events.lock().push(format!("post_prepare {port} {ch_mask:#x}"));
    }

    fn pre_port_unprepare(&self, _slave: SlaveId, port: u8, _ch_mask: u8, _bank: Bank) {
        self.events.lock().push(format!("pre_unprepare {port}"));
    }

    fn post_port_unprepare(&self, _slave: SlaveId, port: u8, _ch_mask: u8, _bank: Bank) {
        self.events.lock().push(format!("post_unprepare {port}"));
    }

    fn update_status(&self, _slave: SlaveId, status: SlaveStatus) {
        self.events.lock().push(format!("status {status:?}"));
    }

    fn handle_impl_def_interrupts(
        &self,
        _slave: SlaveId,
        status: &ImplDefStatus,
    ) -> sdwire_core::Result<()> {
        self.events
            .lock()
            .push(format!("impl_def {:#x}", status.control_port));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Enumeration and status
// ---------------------------------------------------------------------------

/// Devices answering at address 0 get the lowest free numbers and have
/// their interrupt masks programmed on attach.
#[test]
fn test_enumeration_assigns_numbers_and_unmasks_interrupts() {
    let rig = rig_with(
        CoreConfig::instant(),
        SimController::new().with_slave(CODEC).with_slave(AMP),
    );
    let codec = enumerate(&rig, &CODEC);
    let amp = rig
        .manager
        .wait_for_slave_enumeration(rig.bus, &AMP)
        .expect("second slave should enumerate in the same pass");

    let mut numbers = [codec.dev_num, amp.dev_num];
    numbers.sort_unstable();
    assert_eq!(numbers, [1, 2]);
    assert_eq!(rig.sim.dev_num_of(&CODEC), Some(codec.dev_num));

    let info = rig.manager.slave(codec).unwrap();
    assert_eq!(info.status, SlaveStatus::Attached);
    assert_eq!(info.dev_id, CODEC);
    assert!(!info.has_caps);

    let mask = scp::INT1_IMPL_DEF | scp::INT1_BUS_CLASH | scp::INT1_PARITY;
    assert_eq!(rig.sim.register(codec.dev_num, scp::INTMASK1), Some(mask));
}

/// Registering capabilities on an attached slave unmasks its port interrupts.
#[test]
fn test_capabilities_program_port_interrupt_masks() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let port_mask = dpn::INT_IMPL_DEF | dpn::INT_TEST_FAIL | dpn::INT_PORT_READY;
    assert_eq!(
        rig.sim.register(slave.dev_num, port_reg(1, dpn::INTMASK)),
        Some(port_mask)
    );
    assert!(rig.manager.slave(slave).unwrap().has_caps);
}

/// Waiting for a device that never shows up times out.
#[test]
fn test_enumeration_wait_times_out() {
    let rig = rig_with(
        CoreConfig::instant().with_enumeration_timeout_ms(20),
        SimController::new(),
    );
    let err = rig
        .manager
        .wait_for_slave_enumeration(rig.bus, &CODEC)
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

/// A slave that lost its number re-enumerates to the same address.
#[test]
fn test_reenumeration_keeps_device_number() {
    let rig = rig();
    let first = enumerate(&rig, &CODEC);
    rig.manager
        .stop_clock(rig.bus, ClockStopMode::Mode1)
        .expect("clock stop should succeed");
    assert_eq!(
        rig.manager.slave(first).unwrap().status,
        SlaveStatus::NotPresent
    );

    rig.sim.reset_slaves();
    let again = enumerate(&rig, &CODEC);
    assert_eq!(again, first);
}

/// Parity and bus clash alerts are counted and cleared.
#[test]
fn test_alert_counts_and_clears_control_port_interrupts() {
    let rig = rig();
    let slave = enumerate(&rig, &CODEC);
    rig.sim
        .raise(slave.dev_num, scp::INTSTAT1, scp::INT1_PARITY | scp::INT1_BUS_CLASH);
    rig.manager
        .update_slave_status(
            rig.bus,
            StatusReport::new().with(slave.dev_num, SlaveStatus::Alert),
        )
        .unwrap();

    assert!(wait_for(|| rig.manager.slave(slave).unwrap().status == SlaveStatus::Alert));
    let info = rig.manager.slave(slave).unwrap();
    assert_eq!(info.alerts.parity, 1);
    assert_eq!(info.alerts.bus_clash, 1);
    assert_eq!(rig.sim.register(slave.dev_num, scp::INTSTAT1), Some(0));
}

/// Port interrupts are found through the port bits of the first status
/// register and cleared at the port.
#[test]
fn test_alert_follows_port_status() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    rig.sim.raise(
        slave.dev_num,
        scp::INTSTAT1,
        1 << (scp::INT1_PORT_SHIFT + 1),
    );
    rig.sim
        .raise(slave.dev_num, port_reg(1, dpn::INTSTAT), dpn::INT_TEST_FAIL);
    rig.manager
        .update_slave_status(
            rig.bus,
            StatusReport::new().with(slave.dev_num, SlaveStatus::Alert),
        )
        .unwrap();

    assert!(wait_for(|| rig.manager.slave(slave).unwrap().alerts.test_fail == 1));
    assert_eq!(
        rig.sim.register(slave.dev_num, port_reg(1, dpn::INTSTAT)),
        Some(0)
    );
}

/// Implementation-defined interrupts reach the bound driver, which also
/// hears about status changes.
#[test]
fn test_driver_receives_impl_def_interrupts_and_status() {
    let rig = rig();
    let slave = enumerate(&rig, &CODEC);
    let driver = Arc::new(RecordingDriver::default());
    rig.manager.bind_slave_driver(slave, driver.clone()).unwrap();

    rig.sim
        .raise(slave.dev_num, scp::INTSTAT1, scp::INT1_IMPL_DEF);
    rig.manager
        .update_slave_status(
            rig.bus,
            StatusReport::new().with(slave.dev_num, SlaveStatus::Alert),
        )
        .unwrap();

    assert!(wait_for(|| driver.events.lock().len() == 2));
    let events = driver.events.lock().clone();
    assert_eq!(
        events,
        vec![
            format!("impl_def {:#x}", scp::INT1_IMPL_DEF),
            "status Alert".to_string(),
        ]
    );
    assert_eq!(rig.manager.slave(slave).unwrap().alerts.impl_def, 1);
}

// ---------------------------------------------------------------------------
// Stream lifecycle
// ---------------------------------------------------------------------------

/// One 48 kHz stereo stream picks the full clock and the narrowest frame.
#[test]
fn test_single_stream_bus_configuration() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);

    rig.manager
        .prepare_and_enable(tag, true)
        .expect("stream should start");

    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.bandwidth, 1_536_000);
    assert_eq!(state.clk_freq, 49_152_000);
    assert_eq!(state.clk_div, 1);
    assert_eq!(state.frame, Some(FrameShape::new(100, 2)));
    assert_eq!(state.frame_freq, 245_760);
    assert_eq!(state.system_interval, 25_600);
    // prepare and enable each switched once
    assert_eq!(state.active_bank(), Bank::A);

    let stream = rig.manager.stream(tag).unwrap();
    assert_eq!(stream.state, StreamState::Enable);
    let rt = &stream.masters[0];
    assert_eq!((rt.hstart, rt.hstop), (1, 1));
    assert_eq!(rt.block_offset, 33);
    assert_eq!(rt.ports[0].transport.offset(), 1);
    assert_eq!(rt.ports[0].transport.sample_interval, 1024);
    assert_eq!(rt.slaves[0].state, StreamState::Enable);
    assert_eq!(rt.slaves[0].ports[0].transport.offset(), 33);
}

/// The slave's transport registers, prepare handshake and channel enables
/// land where the register map says.
#[test]
fn test_single_stream_slave_registers() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let dev = slave.dev_num;
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);

    rig.manager.prepare(tag).unwrap();
    // staged into bank 1, which is now live
    let reg = |r| rig.sim.register(dev, banked_port_reg(1, r, Bank::B));
    assert_eq!(reg(dpn::SAMPLECTRL1), Some(0xff));
    assert_eq!(reg(dpn::SAMPLECTRL2), Some(0x03));
    assert_eq!(reg(dpn::OFFSETCTRL1), Some(33));
    assert_eq!(reg(dpn::HCTRL), Some(0x11));
    assert_eq!(rig.sim.register(dev, port_reg(1, dpn::BLOCKCTRL1)), Some(15));
    assert_eq!(rig.sim.register(dev, port_reg(1, dpn::PREPARECTRL)), Some(0x3));
    assert_eq!(rig.sim.register(dev, frame_ctrl(Bank::B)), Some(9 << 3));

    rig.manager.enable(tag).unwrap();
    assert_eq!(
        rig.sim.register(dev, banked_port_reg(1, dpn::CHANNELEN, Bank::A)),
        Some(0x3)
    );
    assert_eq!(rig.sim.register(dev, frame_ctrl(Bank::A)), Some(9 << 3));
}

/// Master ports are programmed and prepared through the controller callbacks.
#[test]
fn test_master_callbacks_follow_lifecycle() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);
    rig.sim.clear_log();

    rig.manager.prepare(tag).unwrap();
    let calls = rig.sim.calls();
    assert!(calls.contains(&MasterCall::ClockFreq {
        freq: 49_152_000,
        bank: Bank::B
    }));
    assert!(calls.contains(&MasterCall::FrameShape {
        shape: FrameShape::new(100, 2),
        bank: Bank::B
    }));
    assert!(calls.contains(&MasterCall::SspInterval {
        interval: 25_600,
        bank: Bank::B
    }));
    assert!(calls.contains(&MasterCall::Prepare(PrepareCh {
        port_num: 1,
        ch_mask: 0x3,
        prepare: true,
        bank: Bank::B,
    })));

    rig.manager.enable(tag).unwrap();
    assert!(rig.sim.calls().contains(&MasterCall::Activate {
        port: 1,
        ch_mask: 0x3,
        activate: true,
        bank: Bank::A,
    }));
}

/// Tearing the only stream down returns the bus to idle.
#[test]
fn test_disable_and_unprepare_returns_bus_to_idle() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let dev = slave.dev_num;
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);
    rig.manager.prepare_and_enable(tag, true).unwrap();

    rig.manager
        .disable_and_unprepare(tag, true)
        .expect("stream should stop");

    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.bandwidth, 0);
    assert_eq!(state.frame, None);
    assert_eq!(state.system_interval, 0);
    assert_eq!(rig.manager.stream(tag).unwrap().state, StreamState::Unprepare);
    assert_eq!(
        rig.sim.register(dev, banked_port_reg(1, dpn::CHANNELEN, Bank::A)),
        Some(0)
    );
    assert_eq!(rig.sim.register(dev, port_reg(1, dpn::PREPARECTRL)), Some(0));

    // an unprepared stream can be prepared again
    rig.manager.prepare(tag).unwrap();
    assert_eq!(rig.manager.bus_state(rig.bus).unwrap().bandwidth, 1_536_000);
}

/// Two streams at the same rate share one window with consecutive offsets,
/// and the first keeps running while the second joins.
#[test]
fn test_same_rate_streams_share_window() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let dev = slave.dev_num;
    let first = rig.manager.alloc_stream_tag(None).unwrap();
    let second = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, first, slave, 48_000, 1);
    configure_playback(&rig, second, slave, 48_000, 2);

    rig.manager.prepare_and_enable(first, true).unwrap();
    rig.manager.prepare_and_enable(second, true).unwrap();

    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.bandwidth, 3_072_000);
    assert_eq!(state.frame, Some(FrameShape::new(100, 2)));

    let a = rig.manager.stream(first).unwrap();
    let b = rig.manager.stream(second).unwrap();
    assert_eq!(a.masters[0].ports[0].transport.offset(), 1);
    assert_eq!(b.masters[0].ports[0].transport.offset(), 33);
    assert_eq!(a.masters[0].hstart, b.masters[0].hstart);

    let active = state.active_bank();
    assert_eq!(
        rig.sim.register(dev, banked_port_reg(1, dpn::CHANNELEN, active)),
        Some(0x3)
    );
    assert_eq!(
        rig.sim.register(dev, banked_port_reg(2, dpn::CHANNELEN, active)),
        Some(0x3)
    );
}

/// Streams at different rates get disjoint windows, the first group at the
/// right edge of the frame.
#[test]
fn test_mixed_rates_get_disjoint_windows() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let slow = rig.manager.alloc_stream_tag(None).unwrap();
    let fast = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, slow, slave, 48_000, 1);
    configure_playback(&rig, fast, slave, 96_000, 2);

    rig.manager.prepare(slow).unwrap();
    rig.manager.prepare(fast).unwrap();

    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.bandwidth, 1_536_000 + 3_072_000);
    assert_eq!(state.frame, Some(FrameShape::new(100, 4)));
    let a = rig.manager.stream(slow).unwrap();
    let b = rig.manager.stream(fast).unwrap();
    assert_eq!((a.masters[0].hstart, a.masters[0].hstop), (3, 3));
    assert_eq!((b.masters[0].hstart, b.masters[0].hstop), (2, 2));
}

/// A slave port limited to one bus clock pulls the whole bus down to it.
#[test]
fn test_slave_clock_constraint_selects_divider() {
    let rig = rig();
    let port = PortCapability::new(1).with_mode(AudioMode {
        bus_freq: Support::List(vec![12_288_000]),
        sample_rate: Support::List(vec![48_000]),
    });
    let slave = attach_codec(&rig, port);
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);

    rig.manager.prepare(tag).unwrap();
    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.clk_freq, 12_288_000);
    assert_eq!(state.clk_div, 4);
    let stream = rig.manager.stream(tag).unwrap();
    assert_eq!(stream.masters[0].ports[0].transport.sample_interval, 256);
}

/// When no clock satisfies the slaves, prepare fails and leaves the bus
/// untouched.
#[test]
fn test_infeasible_clock_leaves_bus_unchanged() {
    let rig = rig();
    let port = PortCapability::new(1).with_mode(AudioMode {
        bus_freq: Support::List(vec![1_000_000]),
        sample_rate: Support::List(vec![48_000]),
    });
    let slave = attach_codec(&rig, port);
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);
    rig.sim.clear_log();

    let err = rig.manager.prepare(tag).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.bandwidth, 0);
    assert_eq!(state.frame, None);
    assert_eq!(rig.manager.stream(tag).unwrap().masters[0].state, StreamState::Config);
    assert!(rig.sim.messages().is_empty());
}

/// Rates that do not divide the base clock are refused.
#[test]
fn test_asynchronous_rate_is_rejected() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 44_100, 1);

    let err = rig.manager.prepare(tag).unwrap_err();
    assert!(err.to_string().contains("asynchronous mode not supported"));
}

/// Slave ports in simplified prepare mode skip the register handshake;
/// driver hooks still run.
#[test]
fn test_simplified_prepare_skips_handshake() {
    let rig = rig();
    let slave = attach_codec(
        &rig,
        PortCapability::new(1).with_prepare(ChannelPrepare::Simplified),
    );
    let driver = Arc::new(RecordingDriver::default());
    rig.manager.bind_slave_driver(slave, driver.clone()).unwrap();
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);

    rig.manager.prepare(tag).unwrap();
    assert_eq!(
        rig.sim.register(slave.dev_num, port_reg(1, dpn::PREPARECTRL)),
        Some(0)
    );
    let events = driver.events.lock().clone();
    assert_eq!(events, vec!["pre_prepare 1 0x3", "post_prepare 1 0x3"]);
}

/// Lifecycle calls out of order are rejected; repeated ones are no-ops.
#[test]
fn test_lifecycle_order_is_enforced() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);

    assert!(matches!(
        rig.manager.enable(tag),
        Err(Error::InvalidArgument(_))
    ));
    rig.manager.prepare(tag).unwrap();
    rig.manager.prepare(tag).expect("second prepare is a no-op");
    assert_eq!(rig.manager.bus_state(rig.bus).unwrap().bandwidth, 1_536_000);
    assert!(matches!(
        rig.manager.disable(tag),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        rig.manager.release_stream(Endpoint::Master(rig.bus), tag),
        Err(Error::InvalidArgument(_))
    ));
}

/// A disable that fails while staging the next bank leaves the stream
/// running, and a second attempt completes it.
#[test]
fn test_failed_disable_can_be_retried() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let dev = slave.dev_num;
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);
    rig.manager.prepare_and_enable(tag, true).unwrap();
    let live = rig.manager.bus_state(rig.bus).unwrap().active_bank();

    rig.sim.fail_after(0);
    let err = rig.manager.disable(tag).unwrap_err();
    assert!(matches!(err, Error::Io { .. }));

    let stream = rig.manager.stream(tag).unwrap();
    assert_eq!(stream.state, StreamState::Enable);
    assert_eq!(stream.masters[0].state, StreamState::Enable);
    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.active_bank(), live);
    assert_eq!(state.bandwidth, 1_536_000);
    assert_eq!(
        rig.sim.register(dev, banked_port_reg(1, dpn::CHANNELEN, live)),
        Some(0x3)
    );

    rig.manager.disable(tag).expect("second disable should go through");
    let stream = rig.manager.stream(tag).unwrap();
    assert_eq!(stream.state, StreamState::Disable);
    assert_eq!(stream.masters[0].state, StreamState::Disable);
    let live = rig.manager.bus_state(rig.bus).unwrap().active_bank();
    assert_eq!(
        rig.sim.register(dev, banked_port_reg(1, dpn::CHANNELEN, live)),
        Some(0)
    );
}

// ---------------------------------------------------------------------------
// Multi-bus streams
// ---------------------------------------------------------------------------

/// Link-synchronized buses switch banks together around the controller's
/// pre and post hooks.
#[test]
fn test_link_synced_buses_switch_together() {
    let manager = BusManager::new(CoreConfig::instant());
    let sims = [Arc::new(SimController::new()), Arc::new(SimController::new())];
    let buses: Vec<BusId> = sims
        .iter()
        .map(|sim| {
            manager
                .add_master(master_caps().with_link_sync_mask(0x3), sim.clone())
                .unwrap()
        })
        .collect();
    let tag = manager.alloc_stream_tag(None).unwrap();
    let cfg = StreamConfig::new(48_000, 2, 16, Direction::Out);
    for &bus in &buses {
        manager.config_stream(Endpoint::Master(bus), &cfg, tag).unwrap();
        manager
            .config_port(Endpoint::Master(bus), &[PortConfig::new(1, 0x3)], tag)
            .unwrap();
    }

    manager.prepare(tag).expect("synchronized prepare");

    for (sim, &bus) in sims.iter().zip(&buses) {
        let calls = sim.calls();
        assert!(calls.contains(&MasterCall::PreBankSwitch));
        assert!(calls.contains(&MasterCall::PostBankSwitch));
        let state = manager.bus_state(bus).unwrap();
        assert_eq!(state.active_bank(), Bank::B);
        assert_eq!(state.bandwidth, 1_536_000);
    }
    assert_eq!(manager.stream(tag).unwrap().params.channel_count, 4);
}

/// A synchronized switch that never completes times out.
#[test]
fn test_link_synced_switch_times_out() {
    let manager = BusManager::new(CoreConfig::instant().with_bank_switch_timeout_ms(30));
    let stuck = Arc::new(SimController::new());
    stuck.hold_async(true);
    let ok = manager
        .add_master(master_caps().with_link_sync_mask(0x3), Arc::new(SimController::new()))
        .unwrap();
    let held = manager
        .add_master(master_caps().with_link_sync_mask(0x3), stuck.clone())
        .unwrap();
    let tag = manager.alloc_stream_tag(None).unwrap();
    let cfg = StreamConfig::new(48_000, 2, 16, Direction::Out);
    for bus in [ok, held] {
        manager.config_stream(Endpoint::Master(bus), &cfg, tag).unwrap();
    }

    let err = manager.prepare(tag).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    stuck.release_held();
}

/// When the second bus of a stream has no legal clock, the first bus is
/// rolled back too, and retrying does not count the bandwidth twice.
#[test]
fn test_failed_multi_bus_prepare_rolls_back_every_bus() {
    let manager = BusManager::new(CoreConfig::instant());
    let bus_a = manager
        .add_master(master_caps(), Arc::new(SimController::new()))
        .unwrap();
    let bus_b = manager
        .add_master(
            master_caps(),
            Arc::new(SimController::new().with_slave(CODEC)),
        )
        .unwrap();
    manager
        .update_slave_status(bus_b, StatusReport::new().with(0, SlaveStatus::Attached))
        .unwrap();
    let slave = manager.wait_for_slave_enumeration(bus_b, &CODEC).unwrap();
    let fixed_clock = PortCapability::new(1).with_mode(AudioMode {
        bus_freq: Support::List(vec![1_000_000]),
        sample_rate: Support::List(vec![48_000]),
    });
    manager
        .register_slave_capabilities(slave, SlaveCapability::new().with_port(fixed_clock))
        .unwrap();

    let tag = manager.alloc_stream_tag(None).unwrap();
    let out = StreamConfig::new(48_000, 2, 16, Direction::Out);
    for bus in [bus_a, bus_b] {
        manager.config_stream(Endpoint::Master(bus), &out, tag).unwrap();
        manager
            .config_port(Endpoint::Master(bus), &[PortConfig::new(1, 0x3)], tag)
            .unwrap();
    }
    let sink = StreamConfig::new(48_000, 2, 16, Direction::In);
    manager.config_stream(Endpoint::Slave(slave), &sink, tag).unwrap();
    manager
        .config_port(Endpoint::Slave(slave), &[PortConfig::new(1, 0x3)], tag)
        .unwrap();

    for _ in 0..2 {
        let err = manager.prepare(tag).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        for bus in [bus_a, bus_b] {
            let state = manager.bus_state(bus).unwrap();
            assert_eq!(state.bandwidth, 0, "{bus} should carry nothing");
            assert_eq!(state.frame, None);
            assert_eq!(state.active_bank(), Bank::A);
        }
    }
    let stream = manager.stream(tag).unwrap();
    for rt in &stream.masters {
        assert_eq!(rt.state, StreamState::Config);
        assert_eq!(rt.stream_bw, 0);
    }

    manager.release_stream_tag(tag);
    for bus in [bus_a, bus_b] {
        let state = manager.bus_state(bus).unwrap();
        assert_eq!(state.bandwidth, 0);
        assert!(state.runtimes.is_empty());
    }
}

// ---------------------------------------------------------------------------
// Transfers, clock stop and bulk access
// ---------------------------------------------------------------------------

/// Busy responses are retried up to the configured count.
#[test]
fn test_transfer_retries_busy_responses() {
    let rig = rig_with(CoreConfig::instant(), SimController::new());
    let msg = || [Msg::write(BROADCAST, scp::SYSTEMCTRL, [0])];

    rig.sim.inject_busy(2);
    let sent = rig
        .manager
        .transfer(rig.bus, &mut msg(), TransferContext::Blocking)
        .expect("two busy answers are within the retry budget");
    assert_eq!(sent, 1);

    rig.sim.inject_busy(10);
    let err = rig
        .manager
        .transfer(rig.bus, &mut msg(), TransferContext::Blocking)
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
}

/// Clock stop on an empty bus succeeds; an unacknowledged stop with a slave
/// attached reports the bus busy.
#[test]
fn test_clock_stop() {
    let rig = rig_with(CoreConfig::instant(), SimController::new());
    rig.manager
        .stop_clock(rig.bus, ClockStopMode::Mode0)
        .expect("empty bus");

    let rig = self::rig();
    let slave = enumerate(&rig, &CODEC);
    rig.sim.fail_after(0);
    let err = rig
        .manager
        .stop_clock(rig.bus, ClockStopMode::Mode0)
        .unwrap_err();
    assert!(matches!(err, Error::Busy(_)));
    assert_eq!(
        rig.manager.slave(slave).unwrap().status,
        SlaveStatus::Attached
    );
}

/// Bulk register access needs controller support and an idle bus.
#[test]
fn test_bulk_register_access() {
    let rig = rig();
    let slave = enumerate(&rig, &CODEC);
    let mut block = BraBlock::read(slave.dev_num, scp::DEVID_0, 6);
    assert!(matches!(
        rig.manager.bra_transfer(rig.bus, &mut block),
        Err(Error::InvalidArgument(_))
    ));

    let rig = rig_with(
        CoreConfig::instant(),
        SimController::new().with_slave(CODEC).with_bulk_support(),
    );
    let slave = enumerate(&rig, &CODEC);
    let mut block = BraBlock::read(slave.dev_num, scp::DEVID_0, 6);
    rig.manager.bra_transfer(rig.bus, &mut block).unwrap();
    assert_eq!(block.values, CODEC.0.to_vec());
    assert!(rig.sim.calls().contains(&MasterCall::Bulk {
        dev_num: slave.dev_num,
        len: 6
    }));
    assert_eq!(
        rig.sim
            .register(slave.dev_num, banked_port_reg(0, dpn::CHANNELEN, Bank::A)),
        Some(0)
    );

    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    let cfg = StreamConfig::new(48_000, 2, 16, Direction::Out);
    rig.manager
        .config_stream(Endpoint::Master(rig.bus), &cfg, tag)
        .unwrap();
    assert!(matches!(
        rig.manager.bra_transfer(rig.bus, &mut block),
        Err(Error::Busy(_))
    ));
}

// ---------------------------------------------------------------------------
// Tags and configuration errors
// ---------------------------------------------------------------------------

/// Callers using the same key share a tag until the last one lets go.
#[test]
fn test_keyed_tags_are_shared() {
    let manager = BusManager::new(CoreConfig::instant());
    let a = manager.alloc_stream_tag(Some("headset")).unwrap();
    let b = manager.alloc_stream_tag(Some("headset")).unwrap();
    let c = manager.alloc_stream_tag(Some("speaker")).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(manager.stream_ref_count(a), Some(2));

    manager.release_stream_tag(a);
    assert_eq!(manager.stream_ref_count(a), Some(1));
    manager.release_stream_tag(a);
    assert_eq!(manager.stream_ref_count(a), None);
    assert!(manager.stream(a).is_err());
}

/// The tag pool is bounded.
#[test]
fn test_tag_pool_exhaustion() {
    let manager = BusManager::new(CoreConfig::instant().with_num_stream_tags(2));
    manager.alloc_stream_tag(None).unwrap();
    manager.alloc_stream_tag(None).unwrap();
    assert!(matches!(
        manager.alloc_stream_tag(None),
        Err(Error::ResourceExhausted(_))
    ));
}

/// Freeing a configured stream detaches it from its bus, which can then be
/// removed.
#[test]
fn test_freeing_tag_detaches_stream() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);
    assert_eq!(rig.manager.bus_state(rig.bus).unwrap().runtimes, vec![tag]);
    assert_eq!(rig.manager.slave(slave).unwrap().usage, 1);
    assert!(matches!(
        rig.manager.remove_master(rig.bus),
        Err(Error::Busy(_))
    ));

    rig.manager.release_stream_tag(tag);
    assert!(rig.manager.bus_state(rig.bus).unwrap().runtimes.is_empty());
    assert_eq!(rig.manager.bus(rig.bus).unwrap().usage_count(), 0);
    assert_eq!(rig.manager.slave(slave).unwrap().usage, 0);
    rig.manager.remove_master(rig.bus).expect("bus is idle");
    assert!(rig.manager.bus_ids().is_empty());
}

/// Freeing a stream that still holds bandwidth hands it back. The bus goes
/// idle once nothing else is left on it.
#[test]
fn test_freeing_active_stream_returns_bandwidth() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let first = rig.manager.alloc_stream_tag(None).unwrap();
    let second = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, first, slave, 48_000, 1);
    configure_playback(&rig, second, slave, 48_000, 2);
    rig.manager.prepare_and_enable(first, true).unwrap();
    rig.manager.prepare(second).unwrap();
    assert_eq!(rig.manager.bus_state(rig.bus).unwrap().bandwidth, 3_072_000);

    rig.manager.release_stream_tag(first);
    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.bandwidth, 1_536_000);
    assert_eq!(state.runtimes, vec![second]);
    assert!(state.frame.is_some());

    rig.manager.release_stream_tag(second);
    let state = rig.manager.bus_state(rig.bus).unwrap();
    assert_eq!(state.bandwidth, 0);
    assert_eq!(state.frame, None);
    assert_eq!(state.system_interval, 0);
    assert!(state.runtimes.is_empty());

    // the next stream is solved against an empty bus
    let next = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, next, slave, 48_000, 1);
    rig.manager.prepare(next).unwrap();
    assert_eq!(rig.manager.bus_state(rig.bus).unwrap().bandwidth, 1_536_000);
}

/// Releasing endpoints one at a time undoes their configuration.
#[test]
fn test_release_stream_endpoints() {
    let rig = rig();
    let slave = attach_codec(&rig, PortCapability::new(1));
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    configure_playback(&rig, tag, slave, 48_000, 1);

    rig.manager
        .release_stream(Endpoint::Slave(slave), tag)
        .unwrap();
    let stream = rig.manager.stream(tag).unwrap();
    assert!(stream.masters[0].slaves.is_empty());
    assert_eq!(stream.refs(), (1, 0));

    rig.manager
        .release_stream(Endpoint::Master(rig.bus), tag)
        .unwrap();
    assert!(rig.manager.stream(tag).unwrap().masters.is_empty());
    assert!(rig.manager.bus_state(rig.bus).unwrap().runtimes.is_empty());
}

/// Bad configuration is refused before anything is recorded.
#[test]
fn test_configuration_errors() {
    let rig = rig();
    let slave = enumerate(&rig, &CODEC);
    let tag = rig.manager.alloc_stream_tag(None).unwrap();
    let m = &rig.manager;
    let out = StreamConfig::new(48_000, 2, 16, Direction::Out);

    let unknown = SlaveId::new(rig.bus, 7);
    assert!(m.config_stream(Endpoint::Slave(unknown), &out, tag).is_err());
    assert!(
        m.config_stream(Endpoint::Master(rig.bus), &StreamConfig::new(48_000, 0, 16, Direction::Out), tag)
            .is_err()
    );

    m.config_stream(Endpoint::Master(rig.bus), &out, tag).unwrap();
    let other_rate = StreamConfig::new(96_000, 2, 16, Direction::Out);
    let err = m
        .config_stream(Endpoint::Slave(slave), &other_rate, tag)
        .unwrap_err();
    assert!(err.to_string().contains("frame rate for aggregated devices not matching"));

    assert!(
        m.config_port(Endpoint::Master(rig.bus), &[PortConfig::new(1, 0)], tag)
            .is_err()
    );
    assert!(
        m.config_port(Endpoint::Master(rig.bus), &[PortConfig::new(9, 0x1)], tag)
            .is_err()
    );

    let sink = StreamConfig::new(48_000, 2, 16, Direction::In);
    m.config_stream(Endpoint::Slave(slave), &sink, tag).unwrap();
    let err = m
        .config_port(Endpoint::Slave(slave), &[PortConfig::new(1, 0x3)], tag)
        .unwrap_err();
    assert!(err.to_string().contains("capabilities not registered"));
}
