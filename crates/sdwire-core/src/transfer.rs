//! Register transfers and the controller interface.
//!
//! [`MasterOps`] is what a bus controller implements. [`TransferPort`] wraps
//! one controller with the bus lock, retry policy and time budget so every
//! caller sees the same serialization and error mapping.

use crate::bank::Bank;
use crate::bra::BraBlock;
use crate::error::{Error, Result};
use crate::frame::FrameShape;
use crate::stream::{PortParams, TransportParams};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgFlag {
    /// Fill `buf` from the device.
    Read,
    /// Send `buf` to the device.
    Write,
}

/// One register transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    /// Target device number. 15 is broadcast, 0 is the unenumerated device.
    pub dev_num: u8,
    /// Register address: low 15 bits plus two paging bytes.
    pub addr: u32,
    /// Direction.
    pub flag: MsgFlag,
    /// Send with the stream synchronization point tag.
    pub ssp_tag: bool,
    /// Data to write, or the destination of a read.
    pub buf: Vec<u8>,
}

impl Msg {
    /// A read of `len` consecutive registers.
    pub fn read(dev_num: u8, addr: u32, len: usize) -> Self {
        Self {
            dev_num,
            addr,
            flag: MsgFlag::Read,
            ssp_tag: false,
            buf: vec![0; len],
        }
    }

    /// A write of consecutive registers.
    pub fn write(dev_num: u8, addr: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            dev_num,
            addr,
            flag: MsgFlag::Write,
            ssp_tag: false,
            buf: data.into(),
        }
    }

    /// Mark the message as a stream synchronization point.
    pub fn with_ssp_tag(mut self) -> Self {
        self.ssp_tag = true;
        self
    }

    /// Whether this is a read.
    pub fn is_read(&self) -> bool {
        self.flag == MsgFlag::Read
    }

    /// Register address without paging bits.
    pub fn reg_addr(&self) -> u16 {
        (self.addr & 0x7fff) as u16
    }

    /// First paging byte.
    pub fn page1(&self) -> u8 {
        ((self.addr >> 15) & 0xff) as u8
    }

    /// Second paging byte.
    pub fn page2(&self) -> u8 {
        ((self.addr >> 23) & 0xff) as u8
    }
}

/// Failure reported by a controller for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XferError {
    /// The controller is busy; the same message may be sent again.
    #[error("controller busy, try again")]
    Retry,
    /// The addressed device did not acknowledge.
    #[error("device {0} did not acknowledge")]
    Nak(u8),
    /// The controller does not implement the operation.
    #[error("operation not supported by controller")]
    Unsupported,
    /// Any other controller failure.
    #[error("{0}")]
    Failed(String),
}

/// Whether a transfer may sleep waiting for the bus lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferContext {
    /// Wait for the bus lock.
    #[default]
    Blocking,
    /// Fail with [`Error::WouldBlock`] if the lock is held.
    Atomic,
}

type Slot = Option<std::result::Result<(), XferError>>;

/// Completion token for an asynchronous transfer.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<(Mutex<Slot>, Condvar)>,
}

impl Completion {
    /// A token that has not completed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome and wake waiters. Later calls are ignored.
    pub fn complete(&self, result: std::result::Result<(), XferError>) {
        let (slot, cv) = &*self.inner;
        let mut slot = slot.lock();
        if slot.is_none() {
            *slot = Some(result);
            cv.notify_all();
        }
    }

    /// Whether an outcome has been recorded.
    pub fn is_done(&self) -> bool {
        self.inner.0.lock().is_some()
    }

    /// Wait until `deadline`. Returns `None` if the transfer is still pending.
    pub fn wait_until(&self, deadline: Instant) -> Slot {
        let (slot, cv) = &*self.inner;
        let mut slot = slot.lock();
        while slot.is_none() {
            if cv.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

/// Channel prepare request passed to the master port callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareCh {
    /// Data port number.
    pub port_num: u8,
    /// Channels affected.
    pub ch_mask: u8,
    /// True to prepare, false to unprepare.
    pub prepare: bool,
    /// Bank the request applies to.
    pub bank: Bank,
}

type OpResult = std::result::Result<(), XferError>;

/// Operations a bus controller provides.
///
/// Only [`xfer_msg`](Self::xfer_msg) is mandatory. Port callbacks default to
/// no-ops for controllers whose master ports need no programming.
pub trait MasterOps: Send + Sync {
    /// Perform one register transfer. `program_page` asks the controller to
    /// write the paging registers first.
    fn xfer_msg(&self, msg: &mut Msg, program_page: bool) -> OpResult;

    /// Start a transfer and signal `done` when it finishes.
    ///
    /// The default runs the transfer synchronously.
    fn xfer_msg_async(&self, msg: &mut Msg, program_page: bool, done: Completion) -> OpResult {
        let result = self.xfer_msg(msg, program_page);
        done.complete(result.clone());
        result
    }

    /// Whether [`xfer_bulk`](Self::xfer_bulk) is implemented.
    fn supports_bulk(&self) -> bool {
        false
    }

    /// Move a block of register data over the data channel.
    fn xfer_bulk(&self, _block: &mut BraBlock) -> OpResult {
        Err(XferError::Unsupported)
    }

    /// Program a master port's control parameters.
    fn set_port_params(&self, _port: u8, _params: &PortParams, _bank: Bank) -> OpResult {
        Ok(())
    }

    /// Program a master port's transport registers.
    fn set_port_transport_params(
        &self,
        _port: u8,
        _params: &TransportParams,
        _bank: Bank,
    ) -> OpResult {
        Ok(())
    }

    /// Enable or disable channels of a master port.
    fn port_activate_ch(&self, _port: u8, _ch_mask: u8, _activate: bool, _bank: Bank) -> OpResult {
        Ok(())
    }

    /// Called before a master port is prepared or unprepared.
    fn port_prepare_ch_pre(&self, _ch: &PrepareCh) -> OpResult {
        Ok(())
    }

    /// Prepare or unprepare a master port.
    fn port_prepare_ch(&self, _ch: &PrepareCh) -> OpResult {
        Ok(())
    }

    /// Called after a master port is prepared or unprepared.
    fn port_prepare_ch_post(&self, _ch: &PrepareCh) -> OpResult {
        Ok(())
    }

    /// Program the stream synchronization point interval.
    fn set_ssp_interval(&self, _interval: u32, _bank: Bank) -> OpResult {
        Ok(())
    }

    /// Program the bus clock.
    fn set_clock_freq(&self, _freq: u32, _bank: Bank) -> OpResult {
        Ok(())
    }

    /// Program the frame shape on the master side.
    fn set_frame_shape(&self, _shape: FrameShape, _bank: Bank) -> OpResult {
        Ok(())
    }

    /// Arm the controller for a synchronized bank switch.
    fn pre_bank_switch(&self) -> OpResult {
        Ok(())
    }

    /// Release the controller after a synchronized bank switch.
    fn post_bank_switch(&self) -> OpResult {
        Ok(())
    }
}

/// One controller behind the bus lock.
pub struct TransferPort {
    ops: Arc<dyn MasterOps>,
    lock: Mutex<()>,
    retries: u32,
    timeout: Duration,
}

impl std::fmt::Debug for TransferPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPort")
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TransferPort {
    /// Wrap a controller.
    pub fn new(ops: Arc<dyn MasterOps>, retries: u32, timeout: Duration) -> Self {
        Self {
            ops,
            lock: Mutex::new(()),
            retries,
            timeout,
        }
    }

    /// The controller.
    pub fn ops(&self) -> &dyn MasterOps {
        self.ops.as_ref()
    }

    /// Run `msgs` in order under the bus lock.
    ///
    /// `paging` tells whether a device number needs its paging registers
    /// programmed. Returns the number of messages transferred.
    pub fn transfer(
        &self,
        msgs: &mut [Msg],
        ctx: TransferContext,
        paging: impl Fn(u8) -> bool,
    ) -> Result<usize> {
        let _guard = match ctx {
            TransferContext::Blocking => self.lock.lock(),
            TransferContext::Atomic => self.lock.try_lock().ok_or(Error::WouldBlock)?,
        };
        for msg in msgs.iter_mut() {
            let page = paging(msg.dev_num);
            self.send(msg, page)?;
        }
        Ok(msgs.len())
    }

    /// Start one message and return without waiting for completion.
    pub fn transfer_async(
        &self,
        msg: &mut Msg,
        ctx: TransferContext,
        program_page: bool,
        done: &Completion,
    ) -> Result<usize> {
        let _guard = match ctx {
            TransferContext::Blocking => self.lock.lock(),
            TransferContext::Atomic => self.lock.try_lock().ok_or(Error::WouldBlock)?,
        };
        self.ops
            .xfer_msg_async(msg, program_page, done.clone())
            .map_err(|e| Error::io(describe(msg), e))?;
        Ok(1)
    }

    fn send(&self, msg: &mut Msg, program_page: bool) -> Result<()> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.ops.xfer_msg(msg, program_page) {
                Ok(()) => return Ok(()),
                Err(XferError::Retry)
                    if attempt < self.retries && start.elapsed() < self.timeout =>
                {
                    attempt += 1;
                    tracing::trace!(
                        dev = msg.dev_num,
                        addr = msg.addr,
                        attempt,
                        "transfer busy, retrying"
                    );
                }
                Err(e) => {
                    tracing::debug!(dev = msg.dev_num, addr = msg.addr, error = %e, "transfer failed");
                    return Err(Error::io(describe(msg), e));
                }
            }
        }
    }
}

fn describe(msg: &Msg) -> String {
    let dir = if msg.is_read() { "read" } else { "write" };
    format!("{dir} dev {} addr {:#x}", msg.dev_num, msg.addr)
}
