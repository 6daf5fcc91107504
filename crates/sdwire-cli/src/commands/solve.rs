//! Bring a topology up on simulated links and report what the solver chose.

use clap::Args;
use sdwire_core::{Bank, BusId, BusState, SlaveId, StreamState, StreamTag};
use serde::Serialize;
use std::path::PathBuf;

use super::common::{Board, load_topology};

/// Bring up a topology and report the bus configuration.
#[derive(Args)]
pub struct SolveArgs {
    /// Path to the topology TOML file
    pub file: PathBuf,

    /// Stop after prepare, leaving channels disabled
    #[arg(long)]
    pub prepare_only: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Stop and release every stream after reporting
    #[arg(long, conflicts_with = "prepare_only")]
    pub teardown: bool,
}

#[derive(Serialize)]
struct BusReport {
    master: String,
    bus: u32,
    clk_freq: u32,
    clk_div: u32,
    frame: Option<String>,
    frame_ctrl: Option<u8>,
    frame_freq: u32,
    bandwidth: u64,
    capacity: u64,
    active_bank: Bank,
    system_interval: u64,
    streams: Vec<RuntimeReport>,
}

#[derive(Serialize)]
struct RuntimeReport {
    stream: String,
    tag: u32,
    state: StreamState,
    rate: u32,
    hstart: u8,
    hstop: u8,
    ports: Vec<PortReport>,
}

#[derive(Serialize)]
struct PortReport {
    owner: String,
    port: u8,
    ch_mask: u8,
    offset: u16,
    sample_interval: u32,
}

/// Run the solve command.
pub fn run(args: SolveArgs) -> anyhow::Result<()> {
    let topology = load_topology(&args.file)?;
    let board = Board::bring_up(&topology)?;
    board.start(!args.prepare_only)?;

    let mut reports = Vec::new();
    for (name, bus) in &board.buses {
        let state = board.manager.bus_state(*bus)?;
        reports.push(bus_report(&board, name, *bus, &state)?);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    if args.teardown {
        board.stop()?;
        if !args.json {
            println!("Teardown complete, all buses idle");
        }
    }

    Ok(())
}

fn bus_report(
    board: &Board,
    master: &str,
    bus: BusId,
    state: &BusState,
) -> anyhow::Result<BusReport> {
    let capacity = state
        .frame
        .map_or(0, |f| u64::from(f.data_bits()) * u64::from(state.frame_freq));

    let mut streams = Vec::new();
    for tag in &state.runtimes {
        let stream = board.manager.stream(*tag)?;
        let Some(runtime) = stream.master(bus) else {
            continue;
        };
        let mut ports: Vec<PortReport> = runtime
            .ports
            .iter()
            .map(|p| PortReport {
                owner: master.to_string(),
                port: p.port_num,
                ch_mask: p.ch_mask,
                offset: p.transport.offset(),
                sample_interval: p.transport.sample_interval,
            })
            .collect();
        for slave in &runtime.slaves {
            let owner = slave_name(board, slave.slave);
            ports.extend(slave.ports.iter().map(|p| PortReport {
                owner: owner.clone(),
                port: p.port_num,
                ch_mask: p.ch_mask,
                offset: p.transport.offset(),
                sample_interval: p.transport.sample_interval,
            }));
        }
        streams.push(RuntimeReport {
            stream: stream_name(board, *tag),
            tag: tag.0,
            state: runtime.state,
            rate: runtime.params.rate,
            hstart: runtime.hstart,
            hstop: runtime.hstop,
            ports,
        });
    }

    Ok(BusReport {
        master: master.to_string(),
        bus: bus.0,
        clk_freq: state.clk_freq,
        clk_div: state.clk_div,
        frame: state.frame.map(|f| f.to_string()),
        frame_ctrl: state.frame.and_then(|f| f.encode()),
        frame_freq: state.frame_freq,
        bandwidth: state.bandwidth,
        capacity,
        active_bank: state.active_bank(),
        system_interval: state.system_interval,
        streams,
    })
}

fn stream_name(board: &Board, tag: StreamTag) -> String {
    let names: Vec<&str> = board
        .streams
        .iter()
        .filter(|(_, t)| *t == tag)
        .map(|(n, _)| n.as_str())
        .collect();
    if names.is_empty() {
        tag.to_string()
    } else {
        names.join("+")
    }
}

fn slave_name(board: &Board, id: SlaveId) -> String {
    board
        .slaves
        .iter()
        .find(|(_, s)| **s == id)
        .map_or_else(|| id.to_string(), |(n, _)| n.clone())
}

fn print_report(report: &BusReport) {
    println!("{} (bus{})", report.master, report.bus);
    match &report.frame {
        Some(frame) => {
            println!(
                "  Clock:      {:.3} MHz (divider {})",
                f64::from(report.clk_freq) / 1e6,
                report.clk_div
            );
            println!(
                "  Frame:      {frame} (FRAMECTRL {:#04x}) at {} Hz",
                report.frame_ctrl.unwrap_or(0),
                report.frame_freq
            );
            let load = if report.capacity == 0 {
                0.0
            } else {
                report.bandwidth as f64 / report.capacity as f64 * 100.0
            };
            println!(
                "  Bandwidth:  {} / {} bit/s ({load:.1}%)",
                report.bandwidth, report.capacity
            );
            println!("  Bank:       {}", report.active_bank);
        }
        None => println!("  Idle"),
    }

    for stream in &report.streams {
        println!(
            "  {} [{}] {} Hz, window {}..{}",
            stream.stream, stream.state, stream.rate, stream.hstart, stream.hstop
        );
        for port in &stream.ports {
            println!(
                "    {:<12} DP{:<2} mask {:#04x}  offset {:>4}  interval {}",
                port.owner, port.port, port.ch_mask, port.offset, port.sample_interval
            );
        }
    }
}
