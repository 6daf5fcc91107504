//! Bulk register access over data port 0.
//!
//! Register blocks too large for command-word transfers can be moved through
//! the payload columns. The bus must carry no streams while this happens;
//! port 0 borrows the whole payload area for the duration of the transfer.

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::frame::RESET_SHAPE;
use crate::regs::{banked_port_reg, dpn};
use crate::stream::TransportParams;
use crate::transfer::{Msg, TransferContext, XferError};

/// Direction of a bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BraOp {
    /// Read registers into `values`.
    Read,
    /// Write `values` to registers.
    Write,
}

/// One bulk transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BraBlock {
    /// Target device number.
    pub dev_num: u8,
    /// Direction.
    pub op: BraOp,
    /// First register address.
    pub reg_offset: u32,
    /// Data written, or filled on read.
    pub values: Vec<u8>,
}

impl BraBlock {
    /// A bulk read of `len` registers.
    pub fn read(dev_num: u8, reg_offset: u32, len: usize) -> Self {
        Self {
            dev_num,
            op: BraOp::Read,
            reg_offset,
            values: vec![0; len],
        }
    }

    /// A bulk write.
    pub fn write(dev_num: u8, reg_offset: u32, values: Vec<u8>) -> Self {
        Self {
            dev_num,
            op: BraOp::Write,
            reg_offset,
            values,
        }
    }
}

const DP0: u8 = 0;
const DP0_CHANNEL: u8 = 0x01;

impl Bus {
    /// Run a bulk transfer through data port 0 of `block.dev_num`.
    pub fn bra_transfer(&self, block: &mut BraBlock) -> Result<()> {
        if !self.ops().supports_bulk() {
            return Err(Error::invalid(format!(
                "{}: controller does not support bulk register access",
                self.id()
            )));
        }
        let (frame, bank) = {
            let state = self.lock_state();
            if !state.runtimes.is_empty() {
                return Err(Error::busy(format!(
                    "{}: {} stream(s) attached",
                    self.id(),
                    state.runtimes.len()
                )));
            }
            let frame = state
                .frame
                .or(state.banks.active().frame)
                .unwrap_or(RESET_SHAPE);
            (frame, state.active_bank())
        };

        let profile = TransportParams {
            sample_interval: frame.interval(),
            hstart: 1,
            hstop: (frame.cols - 1) as u8,
            block_group_control_valid: true,
            ..TransportParams::default()
        };
        let dev = block.dev_num;
        let mut setup = [
            Msg::write(
                dev,
                banked_port_reg(DP0, dpn::BLOCKCTRL2, bank),
                profile.register_bytes(),
            ),
            Msg::write(dev, banked_port_reg(DP0, dpn::CHANNELEN, bank), [DP0_CHANNEL]),
        ];
        self.transfer(&mut setup, TransferContext::Blocking)?;

        let result = self.ops().xfer_bulk(block);

        let mut teardown = [
            Msg::write(dev, banked_port_reg(DP0, dpn::CHANNELEN, bank), [0]),
            Msg::write(
                dev,
                banked_port_reg(DP0, dpn::BLOCKCTRL2, bank),
                TransportParams {
                    block_group_control_valid: true,
                    ..TransportParams::default()
                }
                .register_bytes(),
            ),
        ];
        self.transfer(&mut teardown, TransferContext::Blocking)?;

        match result {
            Ok(()) => {
                tracing::debug!(bus = %self.id(), dev, len = block.values.len(), op = ?block.op, "bulk transfer done");
                Ok(())
            }
            Err(XferError::Unsupported) => Err(Error::invalid(format!(
                "{}: controller rejected bulk register access",
                self.id()
            ))),
            Err(e) => Err(Error::io("bulk register access", e)),
        }
    }
}
