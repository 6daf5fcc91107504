//! Slave devices: identity, status and driver callbacks.

use crate::bank::Bank;
use crate::bus::BusId;
use crate::caps::SlaveCapability;
use crate::error::Result;
use crate::regs::{DEV_ID_LEN, MAX_DEVICES, STATUS_SLOTS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Six-byte device ID read from `DEVID_0..=DEVID_5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DevId(pub [u8; DEV_ID_LEN]);

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for DevId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; DEV_ID_LEN];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts
                .next()
                .ok_or_else(|| format!("device id '{s}' has fewer than {DEV_ID_LEN} bytes"))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("device id '{s}': '{part}' is not a hex byte"))?;
        }
        if parts.next().is_some() {
            return Err(format!("device id '{s}' has more than {DEV_ID_LEN} bytes"));
        }
        Ok(DevId(bytes))
    }
}

/// A slave on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaveId {
    /// The bus.
    pub bus: BusId,
    /// Assigned device number (1..=11).
    pub dev_num: u8,
}

impl SlaveId {
    /// Create a slave id.
    pub const fn new(bus: BusId, dev_num: u8) -> Self {
        Self { bus, dev_num }
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:dev{}", self.bus, self.dev_num)
    }
}

/// Attachment status of one device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveStatus {
    /// Nothing answers at this number.
    #[default]
    NotPresent,
    /// Attached and idle.
    Attached,
    /// Attached with an interrupt pending.
    Alert,
}

/// Status of every device number, as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReport {
    status: [SlaveStatus; STATUS_SLOTS],
}

impl StatusReport {
    /// Everything not present.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status of one device number. Numbers above 11 are ignored.
    pub fn with(mut self, dev_num: u8, status: SlaveStatus) -> Self {
        if let Some(slot) = self.status.get_mut(usize::from(dev_num)) {
            *slot = status;
        }
        self
    }

    /// Status of one device number.
    pub fn get(&self, dev_num: u8) -> SlaveStatus {
        self.status
            .get(usize::from(dev_num))
            .copied()
            .unwrap_or_default()
    }

    /// `(device number, status)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, SlaveStatus)> + '_ {
        self.status
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u8, *s))
    }
}

/// Interrupt counts accumulated by alert handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AlertCounters {
    /// Parity errors.
    pub parity: u32,
    /// Bus clashes.
    pub bus_clash: u32,
    /// Port test failures.
    pub test_fail: u32,
    /// Implementation-defined interrupts forwarded to the driver.
    pub impl_def: u32,
}

/// Implementation-defined interrupt bits collected during one alert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImplDefStatus {
    /// Control port bits from `INTSTAT1`.
    pub control_port: u8,
    /// `(port, bits)` for each data port with implementation-defined bits set.
    pub ports: Vec<(u8, u8)>,
}

impl ImplDefStatus {
    /// Whether any bit is set.
    pub fn is_empty(&self) -> bool {
        self.control_port == 0 && self.ports.is_empty()
    }
}

/// Callbacks a peripheral driver can hook into.
///
/// Every method has an empty default.
pub trait SlaveDriver: Send + Sync {
    /// Before a port's prepare handshake.
    fn pre_port_prepare(&self, _slave: SlaveId, _port: u8, _ch_mask: u8, _bank: Bank) {}

    /// After a port's prepare handshake.
    fn post_port_prepare(&self, _slave: SlaveId, _port: u8, _ch_mask: u8, _bank: Bank) {}

    /// Before a port's unprepare handshake.
    fn pre_port_unprepare(&self, _slave: SlaveId, _port: u8, _ch_mask: u8, _bank: Bank) {}

    /// After a port's unprepare handshake.
    fn post_port_unprepare(&self, _slave: SlaveId, _port: u8, _ch_mask: u8, _bank: Bank) {}

    /// The slave's attachment status changed.
    fn update_status(&self, _slave: SlaveId, _status: SlaveStatus) {}

    /// Implementation-defined interrupts fired.
    fn handle_impl_def_interrupts(&self, _slave: SlaveId, _status: &ImplDefStatus) -> Result<()> {
        Ok(())
    }
}

/// Public view of one slave slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaveInfo {
    /// Identity on the bus.
    pub id: SlaveId,
    /// Device ID.
    pub dev_id: DevId,
    /// Last known status.
    pub status: SlaveStatus,
    /// Whether capabilities were registered.
    pub has_caps: bool,
    /// Interrupt counters.
    pub alerts: AlertCounters,
    /// Stream endpoints currently configured on this slave.
    pub usage: u32,
}

#[derive(Default, Clone)]
pub(crate) struct SlaveSlot {
    pub assigned: bool,
    pub dev_id: DevId,
    pub status: SlaveStatus,
    pub caps: Option<SlaveCapability>,
    pub driver: Option<Arc<dyn SlaveDriver>>,
    pub alerts: AlertCounters,
    pub usage: u32,
}

/// Device-number table of one bus. Index 0 is the unenumerated address and
/// never assigned.
#[derive(Default)]
pub(crate) struct SlaveTable {
    slots: [SlaveSlot; STATUS_SLOTS],
}

impl SlaveTable {
    pub fn find(&self, dev_id: &DevId) -> Option<u8> {
        (1..=MAX_DEVICES).find(|&n| {
            let slot = &self.slots[usize::from(n)];
            slot.assigned && slot.dev_id == *dev_id
        })
    }

    /// Reserve the lowest free device number for `dev_id`.
    pub fn assign(&mut self, dev_id: DevId) -> Option<u8> {
        let n = (1..=MAX_DEVICES).find(|&n| !self.slots[usize::from(n)].assigned)?;
        let slot = &mut self.slots[usize::from(n)];
        slot.assigned = true;
        slot.dev_id = dev_id;
        slot.status = SlaveStatus::NotPresent;
        Some(n)
    }

    pub fn slot(&self, dev_num: u8) -> Option<&SlaveSlot> {
        self.slots
            .get(usize::from(dev_num))
            .filter(|s| dev_num != 0 && s.assigned)
    }

    pub fn slot_mut(&mut self, dev_num: u8) -> Option<&mut SlaveSlot> {
        self.slots
            .get_mut(usize::from(dev_num))
            .filter(|s| dev_num != 0 && s.assigned)
    }

    pub fn info(&self, bus: BusId, dev_num: u8) -> Option<SlaveInfo> {
        self.slot(dev_num).map(|s| SlaveInfo {
            id: SlaveId::new(bus, dev_num),
            dev_id: s.dev_id,
            status: s.status,
            has_caps: s.caps.is_some(),
            alerts: s.alerts,
            usage: s.usage,
        })
    }

    pub fn assigned(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=MAX_DEVICES).filter(|&n| self.slots[usize::from(n)].assigned)
    }

    pub fn any_present(&self) -> bool {
        self.assigned()
            .any(|n| self.slots[usize::from(n)].status != SlaveStatus::NotPresent)
    }
}
