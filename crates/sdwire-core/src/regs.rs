//! SoundWire 1.x register map.
//!
//! Addresses are 32-bit: the low 15 bits select a register and the upper bits
//! carry the two paging bytes for devices that implement paging.

use crate::bank::Bank;

/// Device number addressing every attached slave.
pub const BROADCAST: u8 = 15;
/// Device number answered by slaves that have not been enumerated yet.
pub const UNENUMERATED: u8 = 0;
/// Highest assignable device number.
pub const MAX_DEVICES: u8 = 11;
/// Number of status slots (device 0 plus 1..=11).
pub const STATUS_SLOTS: usize = MAX_DEVICES as usize + 1;
/// Length of a device ID in bytes.
pub const DEV_ID_LEN: usize = 6;
/// Highest data port number.
pub const MAX_PORTS: u8 = 14;
/// Address stride between data port register blocks.
pub const DPN_STRIDE: u32 = 0x100;
/// Offset of bank 1 within banked register groups.
pub const BANK1_OFFSET: u32 = 0x10;
/// Number of transport bytes written starting at `BLOCKCTRL2`.
pub const TRANSPORT_LEN: usize = 8;

/// Slave control port registers.
pub mod scp {
    /// Interrupt status 1.
    pub const INTSTAT1: u32 = 0x40;
    /// Interrupt mask 1.
    pub const INTMASK1: u32 = 0x41;
    /// Interrupt status 2 (ports 4-10).
    pub const INTSTAT2: u32 = 0x42;
    /// Interrupt status 3 (ports 11-14).
    pub const INTSTAT3: u32 = 0x43;
    /// Control register.
    pub const CTRL: u32 = 0x44;
    /// System control.
    pub const SYSTEMCTRL: u32 = 0x45;
    /// Device number assignment.
    pub const DEVNUMBER: u32 = 0x46;
    /// Address page 1.
    pub const ADDRPAGE1: u32 = 0x48;
    /// Address page 2.
    pub const ADDRPAGE2: u32 = 0x49;
    /// First of the six device ID bytes.
    pub const DEVID_0: u32 = 0x50;
    /// Frame control, bank 0. Bank 1 is at `FRAMECTRL + BANK1_OFFSET`.
    pub const FRAMECTRL: u32 = 0x60;

    /// INTSTAT1: parity error.
    pub const INT1_PARITY: u8 = 1 << 0;
    /// INTSTAT1: bus clash.
    pub const INT1_BUS_CLASH: u8 = 1 << 1;
    /// INTSTAT1: implementation-defined.
    pub const INT1_IMPL_DEF: u8 = 1 << 2;
    /// INTSTAT1: first port bit (ports 0-3 occupy bits 3-6).
    pub const INT1_PORT_SHIFT: u8 = 3;
    /// INTSTAT1: ports 0-3.
    pub const INT1_PORT_MASK: u8 = 0x78;
    /// INTSTAT1: cascade into INTSTAT2.
    pub const INT1_SCP2_CASCADE: u8 = 1 << 7;
    /// INTSTAT2: ports 4-10.
    pub const INT2_PORT_MASK: u8 = 0x7f;
    /// INTSTAT2: cascade into INTSTAT3.
    pub const INT2_SCP3_CASCADE: u8 = 1 << 7;
    /// INTSTAT3: ports 11-14.
    pub const INT3_PORT_MASK: u8 = 0x0f;

    /// CTRL: stop the clock at the next frame boundary.
    pub const CTRL_CLK_STOP_NOW: u8 = 1 << 1;
}

/// Data port registers, relative to the port block.
pub mod dpn {
    /// Interrupt status.
    pub const INTSTAT: u32 = 0x00;
    /// Interrupt mask.
    pub const INTMASK: u32 = 0x01;
    /// Port control (flow and data mode).
    pub const PORTCTRL: u32 = 0x02;
    /// Block control 1 (word length).
    pub const BLOCKCTRL1: u32 = 0x03;
    /// Prepare status.
    pub const PREPARESTATUS: u32 = 0x04;
    /// Prepare control.
    pub const PREPARECTRL: u32 = 0x05;
    /// Channel enable, bank 0.
    pub const CHANNELEN: u32 = 0x20;
    /// Block control 2, first transport register.
    pub const BLOCKCTRL2: u32 = 0x21;
    /// Sample interval, low byte.
    pub const SAMPLECTRL1: u32 = 0x22;
    /// Sample interval, high byte.
    pub const SAMPLECTRL2: u32 = 0x23;
    /// Offset, low byte.
    pub const OFFSETCTRL1: u32 = 0x24;
    /// Offset, high byte.
    pub const OFFSETCTRL2: u32 = 0x25;
    /// Horizontal start and stop.
    pub const HCTRL: u32 = 0x26;
    /// Block control 3 (packing mode).
    pub const BLOCKCTRL3: u32 = 0x27;
    /// Lane control.
    pub const LANECTRL: u32 = 0x28;

    /// INTSTAT: test fail.
    pub const INT_TEST_FAIL: u8 = 1 << 0;
    /// INTSTAT: port ready.
    pub const INT_PORT_READY: u8 = 1 << 1;
    /// INTSTAT: implementation-defined bits.
    pub const INT_IMPL_DEF: u8 = 0xe0;
}

/// Address of a data port register.
pub const fn port_reg(port: u8, reg: u32) -> u32 {
    port as u32 * DPN_STRIDE + reg
}

/// Address of a banked data port register.
pub const fn banked_port_reg(port: u8, reg: u32, bank: Bank) -> u32 {
    port_reg(port, reg) + bank.register_offset()
}

/// Address of the frame control register in `bank`.
pub const fn frame_ctrl(bank: Bank) -> u32 {
    scp::FRAMECTRL + bank.register_offset()
}

/// Whether `dev_num` is an assignable device number.
pub const fn is_assignable(dev_num: u8) -> bool {
    dev_num >= 1 && dev_num <= MAX_DEVICES
}
