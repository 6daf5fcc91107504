//! Slave status handling: enumeration, attach/detach and alerts.
//!
//! Controllers report status changes with
//! [`Bus::update_slave_status`]; a per-bus worker thread drains the reports
//! so the reporting context never does register I/O itself.

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::regs::{DEV_ID_LEN, STATUS_SLOTS, UNENUMERATED, dpn, port_reg, scp};
use crate::slave::{AlertCounters, DevId, ImplDefStatus, SlaveId, SlaveStatus, StatusReport};
use crate::transfer::{Msg, TransferContext};
use std::sync::Arc;

/// Start the status worker of `bus`.
///
/// The worker holds only a weak reference and exits when the report channel
/// closes or the bus is dropped.
pub(crate) fn spawn_worker(bus: &Arc<Bus>) -> Result<()> {
    let (tx, rx) = crossbeam_channel::unbounded::<StatusReport>();
    let weak = Arc::downgrade(bus);
    let id = bus.id();
    let handle = std::thread::Builder::new()
        .name(format!("sdw-{id}-status"))
        .spawn(move || {
            for report in rx.iter() {
                let Some(bus) = weak.upgrade() else {
                    break;
                };
                bus.handle_status(&report);
            }
            tracing::debug!(bus = %id, "status worker exiting");
        })?;
    bus.attach_worker(tx, handle);
    Ok(())
}

impl Bus {
    /// Apply one status report.
    pub(crate) fn handle_status(&self, report: &StatusReport) {
        let mut effective = *report;
        if report.get(UNENUMERATED) != SlaveStatus::NotPresent {
            for n in self.enumerate() {
                effective = effective.with(n, SlaveStatus::Attached);
            }
        }

        for (n, status) in effective.iter().skip(1) {
            let previous = match self.slave_table().slot(n) {
                Some(slot) => slot.status,
                None => {
                    if status != SlaveStatus::NotPresent {
                        tracing::warn!(bus = %self.id(), dev = n, ?status, "status for unassigned device");
                    }
                    continue;
                }
            };
            let id = SlaveId::new(self.id(), n);
            match status {
                SlaveStatus::NotPresent => {
                    if previous != SlaveStatus::NotPresent {
                        tracing::info!(slave = %id, "slave detached");
                    }
                }
                SlaveStatus::Attached => {
                    if previous == SlaveStatus::NotPresent {
                        tracing::info!(slave = %id, "slave attached");
                        if let Err(e) = self.program_interrupts(n) {
                            tracing::error!(slave = %id, error = %e, "failed to program interrupt masks");
                        }
                    }
                }
                SlaveStatus::Alert => {
                    if let Err(e) = self.handle_alert(n) {
                        tracing::error!(slave = %id, error = %e, "alert handling failed");
                    }
                }
            }
            if let Some(slot) = self.slave_table().slot_mut(n) {
                slot.status = status;
            }
            if status != previous
                && let Some(driver) = self.slave_driver(n)
            {
                driver.update_status(id, status);
            }
        }
        self.notify_slaves_changed();
    }

    /// Number every device answering at the unenumerated address.
    ///
    /// A device already known by its ID gets its previous number back.
    /// Returns the numbers handed out.
    fn enumerate(&self) -> Vec<u8> {
        let mut assigned = Vec::new();
        // at most one device per slot can be waiting
        for _ in 0..STATUS_SLOTS {
            let mut msgs = [Msg::read(UNENUMERATED, scp::DEVID_0, DEV_ID_LEN)];
            if self.transfer(&mut msgs, TransferContext::Blocking).is_err() {
                break;
            }
            let mut bytes = [0u8; DEV_ID_LEN];
            bytes.copy_from_slice(&msgs[0].buf);
            let dev_id = DevId(bytes);

            let num = {
                let mut table = self.slave_table();
                match table.find(&dev_id) {
                    Some(n) => n,
                    None => match table.assign(dev_id) {
                        Some(n) => n,
                        None => {
                            let err = Error::ResourceExhausted(format!(
                                "no free device number for {dev_id}"
                            ));
                            tracing::error!(bus = %self.id(), error = %err, "enumeration stopped");
                            break;
                        }
                    },
                }
            };
            if let Err(e) = self.write_byte(UNENUMERATED, scp::DEVNUMBER, num) {
                tracing::error!(bus = %self.id(), %dev_id, error = %e, "device number assignment failed");
                break;
            }
            tracing::info!(bus = %self.id(), %dev_id, dev = num, "slave enumerated");
            assigned.push(num);
        }
        assigned
    }

    /// Unmask the interrupts the core handles.
    pub(crate) fn program_interrupts(&self, dev_num: u8) -> Result<()> {
        let mask = scp::INT1_IMPL_DEF | scp::INT1_BUS_CLASH | scp::INT1_PARITY;
        let mut msgs = vec![Msg::write(dev_num, scp::INTMASK1, [mask])];
        if let Some(caps) = self.slave_caps(dev_num) {
            let port_mask = dpn::INT_IMPL_DEF | dpn::INT_TEST_FAIL | dpn::INT_PORT_READY;
            msgs.extend(
                caps.ports
                    .iter()
                    .map(|p| Msg::write(dev_num, port_reg(p.port_num, dpn::INTMASK), [port_mask])),
            );
        }
        self.transfer(&mut msgs, TransferContext::Blocking)?;
        Ok(())
    }

    /// Read, dispatch and clear the pending interrupts of one slave.
    fn handle_alert(&self, dev_num: u8) -> Result<()> {
        let id = SlaveId::new(self.id(), dev_num);
        let mut msgs = [
            Msg::read(dev_num, scp::INTSTAT1, 1),
            Msg::read(dev_num, scp::INTSTAT2, 1),
            Msg::read(dev_num, scp::INTSTAT3, 1),
        ];
        self.transfer(&mut msgs, TransferContext::Blocking)?;
        let (stat1, stat2, stat3) = (msgs[0].buf[0], msgs[1].buf[0], msgs[2].buf[0]);

        let mut clear = 0u8;
        let mut counters = AlertCounters::default();
        let mut impl_def = ImplDefStatus::default();

        if stat1 & scp::INT1_PARITY != 0 {
            tracing::warn!(slave = %id, "parity error");
            clear |= scp::INT1_PARITY;
            counters.parity += 1;
        }
        if stat1 & scp::INT1_BUS_CLASH != 0 {
            tracing::warn!(slave = %id, "bus clash");
            clear |= scp::INT1_BUS_CLASH;
            counters.bus_clash += 1;
        }
        if stat1 & scp::INT1_IMPL_DEF != 0 {
            impl_def.control_port = scp::INT1_IMPL_DEF;
            clear |= scp::INT1_IMPL_DEF;
        }

        let mut ports: Vec<u8> = (0..4)
            .filter(|bit| stat1 & (1 << (scp::INT1_PORT_SHIFT + bit)) != 0)
            .collect();
        if stat1 & scp::INT1_SCP2_CASCADE != 0 {
            ports.extend((0..7).filter(|bit| stat2 & (1 << bit) != 0).map(|bit| 4 + bit));
            if stat2 & scp::INT2_SCP3_CASCADE != 0 {
                ports.extend((0..4).filter(|bit| stat3 & (1 << bit) != 0).map(|bit| 11 + bit));
            }
        }

        for port in ports {
            let addr = port_reg(port, dpn::INTSTAT);
            let status = self.read_byte(dev_num, addr)?;
            if status & dpn::INT_TEST_FAIL != 0 {
                tracing::error!(slave = %id, port, "port test fail");
                counters.test_fail += 1;
            }
            if status & dpn::INT_IMPL_DEF != 0 {
                impl_def.ports.push((port, status & dpn::INT_IMPL_DEF));
            }
            if status != 0 {
                self.write_byte(dev_num, addr, status)?;
            }
        }

        if !impl_def.is_empty() {
            counters.impl_def += 1;
            if let Some(driver) = self.slave_driver(dev_num)
                && let Err(e) = driver.handle_impl_def_interrupts(id, &impl_def)
            {
                tracing::error!(slave = %id, error = %e, "driver interrupt handler failed");
            }
        }

        if clear != 0 {
            self.write_byte(dev_num, scp::INTSTAT1, clear)?;
        }

        if let Some(slot) = self.slave_table().slot_mut(dev_num) {
            slot.alerts.parity += counters.parity;
            slot.alerts.bus_clash += counters.bus_clash;
            slot.alerts.test_fail += counters.test_fail;
            slot.alerts.impl_def += counters.impl_def;
        }
        tracing::debug!(slave = %id, stat1, stat2, stat3, "alert handled");
        Ok(())
    }
}
