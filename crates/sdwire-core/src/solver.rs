//! Bus clock, frame shape and transport solver.
//!
//! Given the runtimes active on a bus the solver picks a bus clock and frame
//! shape that carry their bandwidth, derives the sample and synchronization
//! intervals, and places each rate group in its own horizontal window of
//! columns.
//!
//! The solver is pure: [`solve`] reads the runtimes and returns a
//! [`Solution`]; nothing changes until [`Solution::apply`] is called, so a
//! failed solve leaves the bus and its runtimes untouched.
//!
//! # Example
//!
//! ```rust
//! use sdwire_core::solver;
//! use sdwire_core::frame::FrameShape;
//!
//! let clock = solver::select_clock_frame(24_576_000, 1_536_000, &[], &[]).unwrap();
//! assert_eq!(clock.clk_freq, 49_152_000);
//! assert_eq!(clock.frame, FrameShape::new(100, 2));
//! ```

use crate::bus::BusState;
use crate::caps::PortCapability;
use crate::error::{Error, Result};
use crate::frame::{self, CONTROL_BITS, FrameShape};
use crate::stream::{MasterRuntime, PortParams, TransportParams};

/// Dividers applied to twice the base clock, tried in order.
pub const CLOCK_DIVIDERS: [u32; 4] = [1, 2, 4, 8];

/// Bus clocks must be a multiple of this.
pub const CLOCK_GRANULARITY: u64 = 3000;

/// Runtimes sharing one sample rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateGroup {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Sum of `bps * channels` over the members.
    pub payload_bits: u32,
    /// Indices into the runtime slice, in input order.
    pub members: Vec<usize>,
}

/// Group runtimes by sample rate in first-seen order.
pub fn group_by_rate(runtimes: &[&MasterRuntime]) -> Vec<RateGroup> {
    let mut groups: Vec<RateGroup> = Vec::new();
    for (idx, rt) in runtimes.iter().enumerate() {
        let bits = rt.params.bits_per_sample_frame();
        match groups.iter_mut().find(|g| g.rate == rt.params.rate) {
            Some(group) => {
                group.payload_bits += bits;
                group.members.push(idx);
            }
            None => groups.push(RateGroup {
                rate: rt.params.rate,
                payload_bits: bits,
                members: vec![idx],
            }),
        }
    }
    groups
}

/// Columns a rate group needs: `ceil(cols * payload / (clk / rate))`.
///
/// `None` when the rate exceeds the clock.
pub fn hwidth(cols: u16, payload_bits: u32, clk_freq: u32, rate: u32) -> Option<u32> {
    let full_bw = u64::from(clk_freq).checked_div(u64::from(rate))?;
    if full_bw == 0 {
        return None;
    }
    let need = (u64::from(cols) * u64::from(payload_bits)).div_ceil(full_bw);
    u32::try_from(need.max(1)).ok()
}

fn columns_needed(groups: &[RateGroup], clk_freq: u32, cols: u16) -> Option<u32> {
    groups
        .iter()
        .map(|g| hwidth(cols, g.payload_bits, clk_freq, g.rate))
        .sum()
}

/// Clock and frame chosen by [`select_clock_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockFrame {
    /// Bus clock in Hz.
    pub clk_freq: u32,
    /// Divider applied to twice the base clock.
    pub clk_div: u32,
    /// Frame shape.
    pub frame: FrameShape,
    /// Frames per second.
    pub frame_freq: u32,
}

/// Pick the highest usable bus clock and the first frame shape that fits.
///
/// A clock is usable when it is a multiple of 3 kHz, exceeds `bandwidth` and
/// every slave port accepts it. A frame fits when it divides the clock evenly,
/// its payload bits cover `bandwidth` and every rate group finds room in the
/// payload columns.
pub fn select_clock_frame(
    base_clk_freq: u32,
    bandwidth: u64,
    groups: &[RateGroup],
    slave_ports: &[PortCapability],
) -> Result<ClockFrame> {
    let double = u64::from(base_clk_freq) * 2;
    for clk_div in CLOCK_DIVIDERS {
        let clk = double / u64::from(clk_div);
        if clk % CLOCK_GRANULARITY != 0 || clk <= bandwidth {
            continue;
        }
        let Ok(clk_freq) = u32::try_from(clk) else {
            continue;
        };
        if let Some(port) = slave_ports.iter().find(|p| !p.accepts_clock(clk_freq)) {
            tracing::trace!(clk_freq, port = port.port_num, "clock rejected by slave port");
            continue;
        }
        for shape in frame::candidates() {
            let interval = shape.interval();
            if clk_freq % interval != 0 {
                continue;
            }
            let frame_freq = clk_freq / interval;
            let data_bw = u64::from(clk_freq) - u64::from(frame_freq) * u64::from(CONTROL_BITS);
            if data_bw < bandwidth {
                continue;
            }
            match columns_needed(groups, clk_freq, shape.cols) {
                Some(need) if need < u32::from(shape.cols) => {}
                _ => continue,
            }
            return Ok(ClockFrame {
                clk_freq,
                clk_div,
                frame: shape,
                frame_freq,
            });
        }
    }
    Err(Error::invalid(format!(
        "no bus clock and frame shape carry {bandwidth} bit/s from a {base_clk_freq} Hz base clock"
    )))
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple; zero if either side is zero.
pub fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

/// Sample and synchronization intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intervals {
    /// `clk / rate` per runtime, in input order.
    pub sample_intervals: Vec<u32>,
    /// LCM of the sample intervals.
    pub stream_interval: u64,
    /// Stream synchronization point interval.
    pub system_interval: u64,
}

/// Derive the intervals for `clock`.
///
/// An already established `system_interval` is kept so running streams do not
/// see their synchronization point move.
pub fn compute_intervals(
    base_clk_freq: u32,
    clock: &ClockFrame,
    runtimes: &[&MasterRuntime],
    system_interval: u64,
) -> Result<Intervals> {
    let mut stream_interval = 1;
    let mut sample_intervals = Vec::with_capacity(runtimes.len());
    for rt in runtimes {
        let interval = clock
            .clk_freq
            .checked_div(rt.params.rate)
            .ok_or_else(|| Error::invalid("stream sample rate is zero"))?;
        stream_interval = lcm(stream_interval, u64::from(interval));
        sample_intervals.push(interval);
    }
    if runtimes.is_empty() {
        stream_interval = 0;
    }
    let system_interval = if system_interval != 0 {
        system_interval
    } else {
        let div = u64::from(base_clk_freq) * 2 / u64::from(clock.clk_freq);
        let interval = div * lcm(stream_interval, u64::from(clock.frame.interval()));
        if interval == 0 {
            return Err(Error::invalid("system interval evaluates to zero"));
        }
        interval
    };
    Ok(Intervals {
        sample_intervals,
        stream_interval,
        system_interval,
    })
}

/// Where one runtime's ports land in the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// First payload column of the window.
    pub hstart: u8,
    /// Last payload column of the window.
    pub hstop: u8,
    /// Block offset of each master port, in port order.
    pub master_offsets: Vec<u16>,
    /// Running offset after the master ports.
    pub block_offset: u16,
    /// Block offsets of each slave's ports, in slave and port order.
    pub slave_offsets: Vec<Vec<u16>>,
}

fn to_offset(value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::invalid(format!("block offset {value} overflows")))
}

/// Assign windows and block offsets.
///
/// Windows are handed out from the right edge of the frame leftwards, one per
/// rate group. Within a group every runtime shares the window and master ports
/// take consecutive offsets starting at 1.
pub fn place(
    clock: &ClockFrame,
    runtimes: &[&MasterRuntime],
    groups: &[RateGroup],
) -> Result<Vec<Placement>> {
    let cols = clock.frame.cols;
    let last_col = u32::from(cols) - 1;
    let mut widths = Vec::with_capacity(groups.len());
    for group in groups {
        let width = hwidth(cols, group.payload_bits, clock.clk_freq, group.rate)
            .ok_or_else(|| Error::invalid(format!("rate {} exceeds bus clock", group.rate)))?;
        widths.push(width);
    }
    let total: u32 = widths.iter().sum();
    if total > last_col {
        return Err(Error::invalid(format!(
            "payload needs {total} columns, frame {} has {last_col}",
            clock.frame
        )));
    }

    let mut placements: Vec<Option<Placement>> = vec![None; runtimes.len()];
    let mut hstop = last_col;
    for (group, width) in groups.iter().zip(widths) {
        let hstart = hstop + 1 - width;
        let mut offset: u32 = 1;
        for &idx in &group.members {
            let rt = runtimes[idx];
            let mut master_offsets = Vec::with_capacity(rt.ports.len());
            for port in &rt.ports {
                master_offsets.push(to_offset(offset)?);
                offset += rt.params.bps * (port.ch_mask & 0x0f).count_ones();
            }
            let block_offset = to_offset(offset)?;
            let mut slave_offsets = Vec::with_capacity(rt.slaves.len());
            let mut slave_offset = offset;
            for slave in &rt.slaves {
                let mut offsets = Vec::with_capacity(slave.ports.len());
                for port in &slave.ports {
                    offsets.push(to_offset(slave_offset)?);
                    slave_offset += slave.params.bps * (port.ch_mask & 0x0f).count_ones();
                }
                slave_offsets.push(offsets);
            }
            placements[idx] = Some(Placement {
                hstart: hstart as u8,
                hstop: hstop as u8,
                master_offsets,
                block_offset,
                slave_offsets,
            });
        }
        hstop = hstart - 1;
    }
    placements
        .into_iter()
        .map(|p| p.ok_or_else(|| Error::invalid("runtime missing from rate groups")))
        .collect()
}

/// Complete result of one solver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    /// Clock and frame.
    pub clock: ClockFrame,
    /// Sample and synchronization intervals.
    pub intervals: Intervals,
    /// One placement per runtime, in input order.
    pub placements: Vec<Placement>,
}

/// Run all three phases for the runtimes on one bus.
///
/// `state.bandwidth` must already include every runtime in `runtimes`.
pub fn solve(
    base_clk_freq: u32,
    state: &BusState,
    runtimes: &[&MasterRuntime],
    slave_ports: &[PortCapability],
) -> Result<Solution> {
    if runtimes.iter().any(|rt| rt.params.rate == 0) {
        return Err(Error::invalid("stream sample rate is zero"));
    }
    let groups = group_by_rate(runtimes);
    let clock = select_clock_frame(base_clk_freq, state.bandwidth, &groups, slave_ports)?;
    let intervals = compute_intervals(base_clk_freq, &clock, runtimes, state.system_interval)?;
    let placements = place(&clock, runtimes, &groups)?;
    tracing::debug!(
        clk_freq = clock.clk_freq,
        frame = %clock.frame,
        groups = groups.len(),
        system_interval = intervals.system_interval,
        "solved bus configuration"
    );
    Ok(Solution {
        clock,
        intervals,
        placements,
    })
}

fn transport(sample_interval: u32, hstart: u8, hstop: u8, offset: u16) -> TransportParams {
    TransportParams {
        sample_interval,
        offset1: (offset & 0xff) as u8,
        offset2: (offset >> 8) as u8,
        hstart,
        hstop,
        block_group_control: 0,
        block_group_control_valid: true,
        block_packing_mode: 0,
        lane_control: 0,
    }
}

impl Solution {
    /// Commit the solution to the bus state and the runtimes it was computed for.
    pub fn apply(&self, state: &mut BusState, runtimes: &mut [&mut MasterRuntime]) {
        state.clk_freq = self.clock.clk_freq;
        state.clk_div = self.clock.clk_div;
        state.frame = Some(self.clock.frame);
        state.frame_freq = self.clock.frame_freq;
        state.stream_interval = self.intervals.stream_interval;
        state.system_interval = self.intervals.system_interval;

        for ((rt, placement), &interval) in runtimes
            .iter_mut()
            .zip(&self.placements)
            .zip(&self.intervals.sample_intervals)
        {
            rt.hstart = placement.hstart;
            rt.hstop = placement.hstop;
            rt.block_offset = placement.block_offset;
            let bps = rt.params.bps;
            for (port, &offset) in rt.ports.iter_mut().zip(&placement.master_offsets) {
                port.transport = transport(interval, placement.hstart, placement.hstop, offset);
                port.params = PortParams {
                    word_length: bps,
                    ..PortParams::default()
                };
            }
            for (slave, offsets) in rt.slaves.iter_mut().zip(&placement.slave_offsets) {
                let bps = slave.params.bps;
                for (port, &offset) in slave.ports.iter_mut().zip(offsets) {
                    port.transport =
                        transport(interval, placement.hstart, placement.hstop, offset);
                    port.params = PortParams {
                        word_length: bps,
                        ..PortParams::default()
                    };
                }
            }
        }
    }
}
