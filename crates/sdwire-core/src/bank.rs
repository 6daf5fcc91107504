//! Double-buffered register banks.
//!
//! Every SoundWire device carries two copies of its frame and transport
//! registers. The live copy drives the bus while the other one is staged; a
//! single broadcast write to the frame control register of the staged bank
//! flips all devices at the same frame boundary.

use crate::regs::BANK1_OFFSET;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Bank {
    /// Bank 0.
    #[default]
    A,
    /// Bank 1.
    B,
}

impl Bank {
    /// The opposite bank.
    pub const fn other(self) -> Self {
        match self {
            Bank::A => Bank::B,
            Bank::B => Bank::A,
        }
    }

    /// Zero-based index, as used by controllers.
    pub const fn index(self) -> usize {
        match self {
            Bank::A => 0,
            Bank::B => 1,
        }
    }

    /// Address offset added to banked registers.
    pub const fn register_offset(self) -> u32 {
        match self {
            Bank::A => 0,
            Bank::B => BANK1_OFFSET,
        }
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bank{}", self.index())
    }
}

/// A pair of values, one live and one staged.
///
/// Only the staged slot is mutable; the live slot changes solely through
/// [`switch`](Self::switch).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Banked<T> {
    slots: [T; 2],
    active: Bank,
}

impl<T> Banked<T> {
    /// Create a pair with bank A live.
    pub fn new(a: T, b: T) -> Self {
        Self {
            slots: [a, b],
            active: Bank::A,
        }
    }

    /// The live bank.
    pub fn active_bank(&self) -> Bank {
        self.active
    }

    /// The staged bank.
    pub fn inactive_bank(&self) -> Bank {
        self.active.other()
    }

    /// Contents of the live bank.
    pub fn active(&self) -> &T {
        &self.slots[self.active.index()]
    }

    /// Contents of the staged bank.
    pub fn inactive(&self) -> &T {
        &self.slots[self.active.other().index()]
    }

    /// Mutable access to the staged bank.
    pub fn inactive_mut(&mut self) -> &mut T {
        &mut self.slots[self.active.other().index()]
    }

    /// Contents of a specific bank.
    pub fn get(&self, bank: Bank) -> &T {
        &self.slots[bank.index()]
    }

    /// Make the staged bank live and return the new live bank.
    pub fn switch(&mut self) -> Bank {
        self.active = self.active.other();
        self.active
    }
}
