//! In-memory controller with simulated slaves.
//!
//! [`SimController`] implements [`MasterOps`] against a set of register maps,
//! one per simulated device. It answers enumeration at device 0, applies
//! broadcast writes to every numbered device, mirrors `PREPARECTRL` into
//! `PREPARESTATUS` and treats interrupt status registers as write-1-to-clear.
//! Every message and controller callback is logged for inspection, and
//! busy responses, failures and withheld completions can be injected.
//!
//! # Example
//!
//! ```rust
//! use sdwire_core::sim::SimController;
//! use sdwire_core::slave::DevId;
//! use sdwire_core::transfer::{MasterOps, Msg};
//!
//! let sim = SimController::new().with_slave(DevId([0, 1, 0x25, 0xd0, 0x10, 0]));
//! let mut msg = Msg::read(0, 0x50, 6);
//! sim.xfer_msg(&mut msg, false).unwrap();
//! assert_eq!(msg.buf[2], 0x25);
//! ```

use crate::bank::Bank;
use crate::bra::{BraBlock, BraOp};
use crate::frame::FrameShape;
use crate::regs::{BROADCAST, DEV_ID_LEN, DPN_STRIDE, UNENUMERATED, dpn, scp};
use crate::slave::DevId;
use crate::stream::{PortParams, TransportParams};
use crate::transfer::{Completion, MasterOps, Msg, PrepareCh, XferError};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A controller callback recorded by [`SimController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterCall {
    /// `set_port_params`.
    PortParams {
        /// Port number.
        port: u8,
        /// Parameters.
        params: PortParams,
        /// Bank.
        bank: Bank,
    },
    /// `set_port_transport_params`.
    Transport {
        /// Port number.
        port: u8,
        /// Parameters.
        params: TransportParams,
        /// Bank.
        bank: Bank,
    },
    /// `port_activate_ch`.
    Activate {
        /// Port number.
        port: u8,
        /// Channels.
        ch_mask: u8,
        /// Enable or disable.
        activate: bool,
        /// Bank.
        bank: Bank,
    },
    /// `port_prepare_ch`.
    Prepare(PrepareCh),
    /// `set_ssp_interval`.
    SspInterval {
        /// Interval.
        interval: u32,
        /// Bank.
        bank: Bank,
    },
    /// `set_clock_freq`.
    ClockFreq {
        /// Clock in Hz.
        freq: u32,
        /// Bank.
        bank: Bank,
    },
    /// `set_frame_shape`.
    FrameShape {
        /// Shape.
        shape: FrameShape,
        /// Bank.
        bank: Bank,
    },
    /// `pre_bank_switch`.
    PreBankSwitch,
    /// `post_bank_switch`.
    PostBankSwitch,
    /// `xfer_bulk`.
    Bulk {
        /// Device number.
        dev_num: u8,
        /// Bytes moved.
        len: usize,
    },
}

#[derive(Debug)]
struct SimSlave {
    dev_id: DevId,
    dev_num: u8,
    regs: HashMap<u32, u8>,
}

impl SimSlave {
    fn read(&self, addr: u32) -> u8 {
        let reg = addr % DPN_STRIDE;
        let mirrored = if addr >= DPN_STRIDE || reg < scp::INTSTAT1 {
            reg == dpn::PREPARESTATUS
        } else {
            false
        };
        if mirrored {
            return self.reg(addr - dpn::PREPARESTATUS + dpn::PREPARECTRL);
        }
        if addr >= scp::DEVID_0 && addr < scp::DEVID_0 + DEV_ID_LEN as u32 {
            return self.dev_id.0[(addr - scp::DEVID_0) as usize];
        }
        self.reg(addr)
    }

    fn reg(&self, addr: u32) -> u8 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: u32, value: u8) {
        if is_write_one_to_clear(addr) {
            let current = self.reg(addr);
            self.regs.insert(addr, current & !value);
        } else {
            self.regs.insert(addr, value);
        }
    }
}

fn is_write_one_to_clear(addr: u32) -> bool {
    matches!(addr, scp::INTSTAT1 | scp::INTSTAT2 | scp::INTSTAT3)
        || (addr % DPN_STRIDE == dpn::INTSTAT)
}

#[derive(Debug, Default)]
struct SimState {
    slaves: Vec<SimSlave>,
    messages: Vec<Msg>,
    calls: Vec<MasterCall>,
    busy: u32,
    fail_after: Option<usize>,
    hold_async: bool,
    held: Vec<Completion>,
    bulk: bool,
}

/// Simulated bus controller.
#[derive(Debug, Default)]
pub struct SimController {
    state: Mutex<SimState>,
}

impl SimController {
    /// A controller with no slaves attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an unenumerated slave.
    pub fn with_slave(self, dev_id: DevId) -> Self {
        self.add_slave(dev_id);
        self
    }

    /// Accept bulk register transfers.
    pub fn with_bulk_support(self) -> Self {
        self.state.lock().bulk = true;
        self
    }

    /// Attach an unenumerated slave.
    pub fn add_slave(&self, dev_id: DevId) {
        self.state.lock().slaves.push(SimSlave {
            dev_id,
            dev_num: UNENUMERATED,
            regs: HashMap::new(),
        });
    }

    /// Make every slave answer at device 0 again, as after a bus reset.
    pub fn reset_slaves(&self) {
        for slave in &mut self.state.lock().slaves {
            slave.dev_num = UNENUMERATED;
            slave.regs.clear();
        }
    }

    /// Device number the slave with `dev_id` currently answers at.
    pub fn dev_num_of(&self, dev_id: &DevId) -> Option<u8> {
        self.state
            .lock()
            .slaves
            .iter()
            .find(|s| s.dev_id == *dev_id)
            .map(|s| s.dev_num)
    }

    /// Read a register of an enumerated slave without logging.
    pub fn register(&self, dev_num: u8, addr: u32) -> Option<u8> {
        let state = self.state.lock();
        state
            .slaves
            .iter()
            .find(|s| s.dev_num == dev_num && dev_num != UNENUMERATED)
            .map(|s| s.read(addr))
    }

    /// Set a register of an enumerated slave without logging.
    pub fn set_register(&self, dev_num: u8, addr: u32, value: u8) {
        let mut state = self.state.lock();
        if let Some(slave) = state
            .slaves
            .iter_mut()
            .find(|s| s.dev_num == dev_num && dev_num != UNENUMERATED)
        {
            slave.regs.insert(addr, value);
        }
    }

    /// Set bits in a register, as the device would when raising an interrupt.
    pub fn raise(&self, dev_num: u8, addr: u32, bits: u8) {
        let current = self.register(dev_num, addr).unwrap_or(0);
        self.set_register(dev_num, addr, current | bits);
    }

    /// Answer the next `n` messages with [`XferError::Retry`].
    pub fn inject_busy(&self, n: u32) {
        self.state.lock().busy = n;
    }

    /// Let `n` more messages through, then fail the next one.
    pub fn fail_after(&self, n: usize) {
        self.state.lock().fail_after = Some(n);
    }

    /// Withhold asynchronous completions until [`release_held`](Self::release_held).
    pub fn hold_async(&self, hold: bool) {
        self.state.lock().hold_async = hold;
    }

    /// Signal every withheld completion.
    pub fn release_held(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for done in held {
            done.complete(Ok(()));
        }
    }

    /// Messages that completed, in order.
    pub fn messages(&self) -> Vec<Msg> {
        self.state.lock().messages.clone()
    }

    /// Controller callbacks, in order.
    pub fn calls(&self) -> Vec<MasterCall> {
        self.state.lock().calls.clone()
    }

    /// Forget the message and callback logs.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.messages.clear();
        state.calls.clear();
    }

    fn record(&self, call: MasterCall) -> Result<(), XferError> {
        self.state.lock().calls.push(call);
        Ok(())
    }
}

fn access(state: &mut SimState, msg: &mut Msg) -> Result<(), XferError> {
    let addr = u32::from(msg.reg_addr());
    match msg.dev_num {
        BROADCAST => {
            if msg.is_read() {
                return Err(XferError::Failed("broadcast read".to_string()));
            }
            for slave in state.slaves.iter_mut().filter(|s| s.dev_num != UNENUMERATED) {
                for (i, b) in msg.buf.iter().enumerate() {
                    slave.write(addr + i as u32, *b);
                }
            }
            Ok(())
        }
        UNENUMERATED => {
            let slave = state
                .slaves
                .iter_mut()
                .find(|s| s.dev_num == UNENUMERATED)
                .ok_or(XferError::Nak(UNENUMERATED))?;
            if msg.is_read() {
                for (i, b) in msg.buf.iter_mut().enumerate() {
                    *b = slave.read(addr + i as u32);
                }
            } else if addr == scp::DEVNUMBER {
                let num = msg.buf.first().copied().unwrap_or(0) & 0x0f;
                slave.dev_num = num;
            }
            Ok(())
        }
        dev => {
            let slave = state
                .slaves
                .iter_mut()
                .find(|s| s.dev_num == dev)
                .ok_or(XferError::Nak(dev))?;
            if msg.is_read() {
                for (i, b) in msg.buf.iter_mut().enumerate() {
                    *b = slave.read(addr + i as u32);
                }
            } else {
                for (i, b) in msg.buf.iter().enumerate() {
                    slave.write(addr + i as u32, *b);
                }
            }
            Ok(())
        }
    }
}

impl MasterOps for SimController {
    fn xfer_msg(&self, msg: &mut Msg, _program_page: bool) -> Result<(), XferError> {
        let mut state = self.state.lock();
        if state.busy > 0 {
            state.busy -= 1;
            return Err(XferError::Retry);
        }
        if let Some(n) = state.fail_after {
            if n == 0 {
                state.fail_after = None;
                return Err(XferError::Failed("injected failure".to_string()));
            }
            state.fail_after = Some(n - 1);
        }
        access(&mut state, msg)?;
        state.messages.push(msg.clone());
        Ok(())
    }

    fn xfer_msg_async(
        &self,
        msg: &mut Msg,
        program_page: bool,
        done: Completion,
    ) -> Result<(), XferError> {
        let result = self.xfer_msg(msg, program_page);
        let mut state = self.state.lock();
        if state.hold_async && result.is_ok() {
            state.held.push(done);
        } else {
            drop(state);
            done.complete(result.clone());
        }
        result
    }

    fn supports_bulk(&self) -> bool {
        self.state.lock().bulk
    }

    fn xfer_bulk(&self, block: &mut BraBlock) -> Result<(), XferError> {
        let mut state = self.state.lock();
        if !state.bulk {
            return Err(XferError::Unsupported);
        }
        let dev = block.dev_num;
        let slave = state
            .slaves
            .iter_mut()
            .find(|s| s.dev_num == dev && dev != UNENUMERATED)
            .ok_or(XferError::Nak(dev))?;
        match block.op {
            BraOp::Read => {
                for (i, b) in block.values.iter_mut().enumerate() {
                    *b = slave.read(block.reg_offset + i as u32);
                }
            }
            BraOp::Write => {
                for (i, b) in block.values.iter().enumerate() {
                    slave.write(block.reg_offset + i as u32, *b);
                }
            }
        }
        let len = block.values.len();
        state.calls.push(MasterCall::Bulk { dev_num: dev, len });
        Ok(())
    }

    fn set_port_params(&self, port: u8, params: &PortParams, bank: Bank) -> Result<(), XferError> {
        self.record(MasterCall::PortParams {
            port,
            params: *params,
            bank,
        })
    }

    fn set_port_transport_params(
        &self,
        port: u8,
        params: &TransportParams,
        bank: Bank,
    ) -> Result<(), XferError> {
        self.record(MasterCall::Transport {
            port,
            params: *params,
            bank,
        })
    }

    fn port_activate_ch(
        &self,
        port: u8,
        ch_mask: u8,
        activate: bool,
        bank: Bank,
    ) -> Result<(), XferError> {
        self.record(MasterCall::Activate {
            port,
            ch_mask,
            activate,
            bank,
        })
    }

    fn port_prepare_ch(&self, ch: &PrepareCh) -> Result<(), XferError> {
        self.record(MasterCall::Prepare(*ch))
    }

    fn set_ssp_interval(&self, interval: u32, bank: Bank) -> Result<(), XferError> {
        self.record(MasterCall::SspInterval { interval, bank })
    }

    fn set_clock_freq(&self, freq: u32, bank: Bank) -> Result<(), XferError> {
        self.record(MasterCall::ClockFreq { freq, bank })
    }

    fn set_frame_shape(&self, shape: FrameShape, bank: Bank) -> Result<(), XferError> {
        self.record(MasterCall::FrameShape { shape, bank })
    }

    fn pre_bank_switch(&self) -> Result<(), XferError> {
        self.record(MasterCall::PreBankSwitch)
    }

    fn post_bank_switch(&self) -> Result<(), XferError> {
        self.record(MasterCall::PostBankSwitch)
    }
}
