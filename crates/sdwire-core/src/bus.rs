//! One SoundWire bus: its controller, bank state and slave table.

use crate::bank::{Bank, Banked};
use crate::caps::{MasterCapability, SlaveCapability};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::frame::FrameShape;
use crate::regs::{BROADCAST, UNENUMERATED, scp};
use crate::slave::{DevId, SlaveDriver, SlaveInfo, SlaveStatus, SlaveTable, StatusReport};
use crate::stream::StreamTag;
use crate::transfer::{Completion, MasterOps, Msg, TransferContext, TransferPort};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Bus identifier, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusId(pub u32);

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus{}", self.0)
    }
}

/// What was last programmed into one register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BankImage {
    /// Frame shape.
    pub frame: Option<FrameShape>,
    /// Bus clock in Hz.
    pub clk_freq: u32,
    /// Stream synchronization point interval.
    pub ssp_interval: u64,
}

/// Mutable configuration of a bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusState {
    /// Bank images; the active one drives the bus.
    pub banks: Banked<BankImage>,
    /// Committed bandwidth in bits per second.
    pub bandwidth: u64,
    /// Bus clock in Hz.
    pub clk_freq: u32,
    /// Divider applied to twice the base clock.
    pub clk_div: u32,
    /// Current frame shape, `None` while idle.
    pub frame: Option<FrameShape>,
    /// Frames per second.
    pub frame_freq: u32,
    /// Stream synchronization point interval in bits.
    pub system_interval: u64,
    /// Least common multiple of the sample intervals.
    pub stream_interval: u64,
    /// Streams with a runtime on this bus, in attach order.
    pub runtimes: Vec<StreamTag>,
}

impl BusState {
    /// The live bank.
    pub fn active_bank(&self) -> Bank {
        self.banks.active_bank()
    }

    /// The staged bank.
    pub fn inactive_bank(&self) -> Bank {
        self.banks.inactive_bank()
    }

    /// Rows per frame, 0 while idle.
    pub fn row(&self) -> u16 {
        self.frame.map_or(0, |f| f.rows)
    }

    /// Columns per frame, 0 while idle.
    pub fn col(&self) -> u16 {
        self.frame.map_or(0, |f| f.cols)
    }

    /// Forget the frame configuration once no bandwidth is committed.
    pub(crate) fn reset_idle(&mut self) {
        self.system_interval = 0;
        self.stream_interval = 0;
        self.frame_freq = 0;
        self.frame = None;
    }
}

/// Clock stop modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockStopMode {
    /// Slaves keep their state.
    Mode0,
    /// Slaves may lose state and re-enumerate on restart.
    Mode1,
}

/// A registered bus.
pub struct Bus {
    id: BusId,
    caps: MasterCapability,
    config: CoreConfig,
    port: TransferPort,
    state: Mutex<BusState>,
    slaves: Mutex<SlaveTable>,
    slaves_changed: Condvar,
    usage: Mutex<u32>,
    status_tx: Mutex<Option<Sender<StatusReport>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id)
            .field("caps", &self.caps)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Bus {
    pub(crate) fn new(
        id: BusId,
        caps: MasterCapability,
        ops: Arc<dyn MasterOps>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            id,
            caps,
            config: config.clone(),
            port: TransferPort::new(ops, config.transfer_retries, config.transfer_timeout()),
            state: Mutex::new(BusState::default()),
            slaves: Mutex::new(SlaveTable::default()),
            slaves_changed: Condvar::new(),
            usage: Mutex::new(0),
            status_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Bus id.
    pub fn id(&self) -> BusId {
        self.id
    }

    /// Master capabilities.
    pub fn caps(&self) -> &MasterCapability {
        &self.caps
    }

    /// The controller.
    pub fn ops(&self) -> &dyn MasterOps {
        self.port.ops()
    }

    /// Copy of the current bus state.
    pub fn state(&self) -> BusState {
        self.state.lock().clone()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock()
    }

    /// Stream endpoints currently configured on the master side.
    pub fn usage_count(&self) -> u32 {
        *self.usage.lock()
    }

    pub(crate) fn acquire(&self) {
        *self.usage.lock() += 1;
    }

    pub(crate) fn release(&self) {
        let mut usage = self.usage.lock();
        *usage = usage.saturating_sub(1);
    }

    // ---- transfers ----

    /// Run `msgs` in order under the bus lock.
    ///
    /// Broadcast messages always program paging, the unenumerated address
    /// never does and slaves follow their registered capabilities.
    pub fn transfer(&self, msgs: &mut [Msg], ctx: TransferContext) -> Result<usize> {
        let paging = self.paging_table();
        self.port
            .transfer(msgs, ctx, |dev| paging.get(usize::from(dev)).copied().unwrap_or(false))
    }

    /// Start one message and return; `done` signals completion.
    pub fn transfer_async(&self, msg: &mut Msg, done: &Completion) -> Result<usize> {
        let page = self
            .paging_table()
            .get(usize::from(msg.dev_num))
            .copied()
            .unwrap_or(false);
        self.port
            .transfer_async(msg, TransferContext::Blocking, page, done)
    }

    pub(crate) fn read_byte(&self, dev_num: u8, addr: u32) -> Result<u8> {
        let mut msgs = [Msg::read(dev_num, addr, 1)];
        self.transfer(&mut msgs, TransferContext::Blocking)?;
        Ok(msgs[0].buf[0])
    }

    pub(crate) fn write_byte(&self, dev_num: u8, addr: u32, value: u8) -> Result<()> {
        self.write(dev_num, addr, vec![value])
    }

    pub(crate) fn write(&self, dev_num: u8, addr: u32, data: Vec<u8>) -> Result<()> {
        let mut msgs = [Msg::write(dev_num, addr, data)];
        self.transfer(&mut msgs, TransferContext::Blocking)?;
        Ok(())
    }

    /// Map a controller callback failure to an [`Error::Io`].
    pub(crate) fn master_call(
        &self,
        what: &str,
        result: std::result::Result<(), crate::transfer::XferError>,
    ) -> Result<()> {
        result.map_err(|e| Error::io(format!("{what} on {}", self.id), e))
    }

    fn paging_table(&self) -> [bool; 16] {
        let slaves = self.slaves.lock();
        let mut table = [false; 16];
        table[usize::from(BROADCAST)] = true;
        for n in slaves.assigned() {
            table[usize::from(n)] = slaves
                .slot(n)
                .and_then(|s| s.caps.as_ref())
                .is_some_and(|c| c.paging_supported);
        }
        table[usize::from(UNENUMERATED)] = false;
        table
    }

    // ---- slaves ----

    /// Snapshot of one slave.
    pub fn slave(&self, dev_num: u8) -> Option<SlaveInfo> {
        self.slaves.lock().info(self.id, dev_num)
    }

    /// Snapshots of all assigned slaves.
    pub fn slaves(&self) -> Vec<SlaveInfo> {
        let table = self.slaves.lock();
        table
            .assigned()
            .filter_map(|n| table.info(self.id, n))
            .collect()
    }

    /// Device number assigned to `dev_id`.
    pub fn find_slave(&self, dev_id: &DevId) -> Option<u8> {
        self.slaves.lock().find(dev_id)
    }

    pub(crate) fn slave_caps(&self, dev_num: u8) -> Option<SlaveCapability> {
        self.slaves.lock().slot(dev_num).and_then(|s| s.caps.clone())
    }

    pub(crate) fn slave_driver(&self, dev_num: u8) -> Option<Arc<dyn SlaveDriver>> {
        self.slaves.lock().slot(dev_num).and_then(|s| s.driver.clone())
    }

    pub(crate) fn is_assigned(&self, dev_num: u8) -> bool {
        self.slaves.lock().slot(dev_num).is_some()
    }

    pub(crate) fn set_slave_caps(&self, dev_num: u8, caps: SlaveCapability) -> Result<()> {
        let mut table = self.slaves.lock();
        let slot = table.slot_mut(dev_num).ok_or_else(|| {
            Error::invalid(format!("{}: device {dev_num} not enumerated", self.id))
        })?;
        slot.caps = Some(caps);
        Ok(())
    }

    pub(crate) fn set_slave_driver(&self, dev_num: u8, driver: Arc<dyn SlaveDriver>) -> Result<()> {
        let mut table = self.slaves.lock();
        let slot = table.slot_mut(dev_num).ok_or_else(|| {
            Error::invalid(format!("{}: device {dev_num} not enumerated", self.id))
        })?;
        slot.driver = Some(driver);
        Ok(())
    }

    pub(crate) fn slave_usage(&self, dev_num: u8, delta: i32) {
        if let Some(slot) = self.slaves.lock().slot_mut(dev_num) {
            slot.usage = slot.usage.saturating_add_signed(delta);
        }
    }

    pub(crate) fn slave_table(&self) -> MutexGuard<'_, SlaveTable> {
        self.slaves.lock()
    }

    pub(crate) fn notify_slaves_changed(&self) {
        self.slaves_changed.notify_all();
    }

    /// Block until `dev_id` is enumerated and attached.
    pub fn wait_for_enumeration(&self, dev_id: &DevId) -> Result<u8> {
        let deadline = Instant::now() + self.config.enumeration_timeout();
        let mut table = self.slaves.lock();
        loop {
            if let Some(n) = table.find(dev_id)
                && table
                    .slot(n)
                    .is_some_and(|s| s.status != SlaveStatus::NotPresent)
            {
                return Ok(n);
            }
            if self
                .slaves_changed
                .wait_until(&mut table, deadline)
                .timed_out()
            {
                return Err(Error::timeout(format!(
                    "enumeration of {dev_id} on {}",
                    self.id
                )));
            }
        }
    }

    // ---- status worker ----

    /// Queue a status report for the worker.
    pub fn update_slave_status(&self, report: StatusReport) -> Result<()> {
        let tx = self.status_tx.lock();
        let tx = tx
            .as_ref()
            .ok_or_else(|| Error::busy(format!("{}: status worker not running", self.id)))?;
        tx.send(report)
            .map_err(|_| Error::busy(format!("{}: status worker stopped", self.id)))
    }

    pub(crate) fn attach_worker(&self, tx: Sender<StatusReport>, handle: JoinHandle<()>) {
        *self.status_tx.lock() = Some(tx);
        *self.worker.lock() = Some(handle);
    }

    /// Stop the status worker and wait for it to exit.
    pub(crate) fn shutdown(&self) {
        self.status_tx.lock().take();
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            tracing::error!(bus = %self.id, "status worker panicked");
        }
    }

    // ---- clock stop ----

    /// Broadcast a clock stop.
    ///
    /// A failed broadcast is only an error while some slave is attached; an
    /// empty bus has nobody to acknowledge it. Mode 1 forgets the attachment
    /// of every slave since they re-enumerate on restart.
    pub fn stop_clock(&self, mode: ClockStopMode) -> Result<()> {
        let mut msgs = [Msg::write(BROADCAST, scp::CTRL, [scp::CTRL_CLK_STOP_NOW])];
        if let Err(e) = self.transfer(&mut msgs, TransferContext::Blocking) {
            if self.slaves.lock().any_present() {
                tracing::error!(bus = %self.id, error = %e, "clock stop broadcast failed");
                return Err(Error::busy(format!(
                    "{}: clock stop not acknowledged",
                    self.id
                )));
            }
            tracing::debug!(bus = %self.id, "clock stop on empty bus");
        }
        if mode == ClockStopMode::Mode1 {
            let mut table = self.slaves.lock();
            let assigned: Vec<u8> = table.assigned().collect();
            for n in assigned {
                if let Some(slot) = table.slot_mut(n) {
                    slot.status = SlaveStatus::NotPresent;
                }
            }
        }
        tracing::info!(bus = %self.id, ?mode, "clock stopped");
        Ok(())
    }
}
