//! Property-based tests for the sdwire-core solver and registries.
//!
//! Tests frame feasibility, window placement, bandwidth accounting across
//! the lifecycle and keyed tag sharing using proptest for randomized input.

use proptest::prelude::*;
use sdwire_core::solver::{self, Solution};
use sdwire_core::{
    BusId, BusManager, BusState, CoreConfig, Direction, Endpoint, FrameShape, MasterCapability,
    MasterRuntime, PortCapability, PortConfig, PortRuntime, SimController, StreamConfig,
    StreamParams, StreamState, StreamTag,
};
use std::collections::HashMap;
use std::sync::Arc;

const BASE_CLK: u32 = 24_576_000;
/// Base clock of a narrower bus that runs out of room first.
const NARROW_CLK: u32 = 9_600_000;
const RATES: [u32; 5] = [8_000, 32_000, 48_000, 96_000, 192_000];
const WIDTHS: [u32; 4] = [8, 16, 24, 32];

fn runtime(rate: u32, channels: u32, bps: u32) -> MasterRuntime {
    let mask = ((1u16 << channels) - 1) as u8;
    MasterRuntime {
        bus: BusId(0),
        direction: Direction::Out,
        params: StreamParams::new(rate, channels, bps),
        ports: vec![PortRuntime::new(1, mask)],
        slaves: Vec::new(),
        state: StreamState::Config,
        stream_bw: 0,
        hstart: 0,
        hstop: 0,
        block_offset: 0,
    }
}

fn master_caps(base_clk_freq: u32, ports: u8) -> MasterCapability {
    let mut caps = MasterCapability::new(base_clk_freq);
    for port in 1..=ports {
        caps = caps.with_port(PortCapability::new(port));
    }
    caps
}

/// Each bus carries exactly the bandwidth of the runtimes still holding it,
/// and an empty bus has no frame.
fn check_bandwidth(
    manager: &BusManager,
    buses: &[BusId],
    live: &[StreamTag],
) -> Result<(), TestCaseError> {
    for &bus in buses {
        let held: u64 = live
            .iter()
            .filter_map(|tag| manager.stream(*tag).ok())
            .map(|stream| {
                stream
                    .master(bus)
                    .filter(|rt| rt.state.holds_bandwidth())
                    .map_or(0, |rt| rt.stream_bw)
            })
            .sum();
        let state = manager.bus_state(bus).unwrap();
        prop_assert_eq!(state.bandwidth, held, "bandwidth on {}", bus);
        if held == 0 {
            prop_assert_eq!(state.frame, None);
        }
    }
    Ok(())
}

fn stream_strategy() -> impl Strategy<Value = (u32, u32, u32)> {
    (
        prop::sample::select(RATES.to_vec()),
        1u32..=4,
        prop::sample::select(WIDTHS.to_vec()),
    )
}

fn solve(runtimes: &[MasterRuntime]) -> (u64, Result<Solution, sdwire_core::Error>) {
    let bandwidth = runtimes.iter().map(|rt| rt.params.bandwidth()).sum();
    let state = BusState {
        bandwidth,
        ..BusState::default()
    };
    let view: Vec<&MasterRuntime> = runtimes.iter().collect();
    (bandwidth, solver::solve(BASE_CLK, &state, &view, &[]))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Any accepted configuration uses a legal frame that divides the clock
    /// evenly and carries the committed bandwidth.
    #[test]
    fn solved_frame_is_feasible(streams in prop::collection::vec(stream_strategy(), 1..5)) {
        let runtimes: Vec<_> = streams.iter().map(|&(r, c, b)| runtime(r, c, b)).collect();
        let (bandwidth, result) = solve(&runtimes);
        if let Ok(sol) = result {
            let frame = sol.clock.frame;
            prop_assert!(frame.is_legal(), "illegal frame {}", frame);
            prop_assert_eq!(sol.clock.clk_freq % frame.interval(), 0);
            prop_assert_eq!(sol.clock.frame_freq * frame.interval(), sol.clock.clk_freq);
            let payload = u64::from(frame.data_bits()) * u64::from(sol.clock.frame_freq);
            prop_assert!(
                payload >= bandwidth,
                "frame {} carries {} bit/s, need {}", frame, payload, bandwidth
            );
            prop_assert!(u64::from(sol.clock.clk_freq) > bandwidth);
            prop_assert_eq!(sol.clock.clk_freq % 3000, 0);
        }
    }

    /// Windows stay inside the payload columns; streams with equal rates share
    /// a window and different rates never overlap.
    #[test]
    fn windows_are_disjoint_per_rate(streams in prop::collection::vec(stream_strategy(), 1..5)) {
        let runtimes: Vec<_> = streams.iter().map(|&(r, c, b)| runtime(r, c, b)).collect();
        let (_, result) = solve(&runtimes);
        if let Ok(sol) = result {
            let cols = sol.clock.frame.cols;
            let mut windows: HashMap<u32, (u8, u8)> = HashMap::new();
            for (rt, p) in runtimes.iter().zip(&sol.placements) {
                prop_assert!(p.hstart >= 1, "window starts in the control column");
                prop_assert!(p.hstart <= p.hstop);
                prop_assert!(u16::from(p.hstop) < cols);
                let window = *windows.entry(rt.params.rate).or_insert((p.hstart, p.hstop));
                prop_assert_eq!(window, (p.hstart, p.hstop));
            }
            let spans: Vec<(u8, u8)> = windows.values().copied().collect();
            for (i, a) in spans.iter().enumerate() {
                for b in &spans[i + 1..] {
                    prop_assert!(a.1 < b.0 || b.1 < a.0, "windows {:?} and {:?} overlap", a, b);
                }
            }
        }
    }

    /// Within a rate group, master port offsets advance by the bits each
    /// port carries.
    #[test]
    fn offsets_advance_by_port_payload(streams in prop::collection::vec(stream_strategy(), 1..5)) {
        let runtimes: Vec<_> = streams.iter().map(|&(r, c, b)| runtime(r, c, b)).collect();
        let (_, result) = solve(&runtimes);
        if let Ok(sol) = result {
            let mut next: HashMap<u32, u32> = HashMap::new();
            for (rt, p) in runtimes.iter().zip(&sol.placements) {
                let expected = next.entry(rt.params.rate).or_insert(1);
                prop_assert_eq!(u32::from(p.master_offsets[0]), *expected);
                *expected += rt.params.bps * rt.ports[0].ch_mask.count_ones();
                prop_assert_eq!(u32::from(p.block_offset), *expected);
            }
        }
    }

    /// Every byte either decodes to a legal frame that encodes back to it or
    /// names a reserved code.
    #[test]
    fn frame_control_codes_are_consistent(value in any::<u8>()) {
        if let Some(shape) = FrameShape::decode(value) {
            prop_assert_eq!(shape.encode(), Some(value));
        }
    }

    /// Same key, same tag; different keys, different tags.
    #[test]
    fn keyed_tags_follow_keys(keys in prop::collection::vec(prop::option::of(0u8..4), 1..20)) {
        let manager = BusManager::new(CoreConfig::instant());
        let mut by_key = HashMap::new();
        let mut seen = Vec::new();
        for key in &keys {
            let name = key.map(|k| format!("dai{k}"));
            let tag = manager.alloc_stream_tag(name.as_deref()).unwrap();
            match key {
                Some(k) => {
                    let first = *by_key.entry(*k).or_insert(tag);
                    prop_assert_eq!(first, tag);
                }
                None => prop_assert!(!seen.contains(&tag)),
            }
            seen.push(tag);
        }
        for (k, tag) in &by_key {
            let holders = keys.iter().filter(|key| **key == Some(*k)).count() as u32;
            prop_assert_eq!(manager.stream_ref_count(*tag), Some(holders));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Bus bandwidth always equals the sum over prepared streams, and drops
    /// back to zero once every stream is torn down.
    #[test]
    fn bandwidth_is_conserved(streams in prop::collection::vec(stream_strategy(), 1..5)) {
        let manager = BusManager::new(CoreConfig::instant());
        let caps = master_caps(BASE_CLK, 4);
        let bus = manager.add_master(caps, Arc::new(SimController::new())).unwrap();

        let mut expected = 0u64;
        let mut running = Vec::new();
        for (i, &(rate, channels, bps)) in streams.iter().enumerate() {
            let tag = manager.alloc_stream_tag(None).unwrap();
            let cfg = StreamConfig::new(rate, channels, bps, Direction::Out);
            manager.config_stream(Endpoint::Master(bus), &cfg, tag).unwrap();
            let mask = ((1u16 << channels) - 1) as u8;
            manager
                .config_port(Endpoint::Master(bus), &[PortConfig::new(i as u8 + 1, mask)], tag)
                .unwrap();

            if manager.prepare_and_enable(tag, true).is_ok() {
                expected += cfg.params().bandwidth();
                running.push((tag, cfg.params().bandwidth()));
            }
            prop_assert_eq!(manager.bus_state(bus).unwrap().bandwidth, expected);
        }

        for (tag, bw) in running {
            manager.disable_and_unprepare(tag, true).unwrap();
            expected -= bw;
            prop_assert_eq!(manager.bus_state(bus).unwrap().bandwidth, expected);
        }
        let state = manager.bus_state(bus).unwrap();
        prop_assert_eq!(state.frame, None);
    }

    /// Streams spread over two buses, some failing to prepare and some freed
    /// while still running, never leave bandwidth behind on either bus.
    #[test]
    fn bandwidth_is_conserved_across_buses(
        streams in prop::collection::vec((stream_strategy(), 0u8..3, any::<bool>()), 1..7)
    ) {
        let manager = BusManager::new(CoreConfig::instant());
        let buses = [
            manager.add_master(master_caps(BASE_CLK, 6), Arc::new(SimController::new())).unwrap(),
            manager.add_master(master_caps(NARROW_CLK, 6), Arc::new(SimController::new())).unwrap(),
        ];

        let mut live = Vec::new();
        for (i, &((rate, channels, bps), placement, _)) in streams.iter().enumerate() {
            let tag = manager.alloc_stream_tag(None).unwrap();
            let cfg = StreamConfig::new(rate, channels, bps, Direction::Out);
            let mask = ((1u16 << channels) - 1) as u8;
            let on: &[BusId] = match placement {
                0 => &buses[..1],
                1 => &buses[1..],
                _ => &buses,
            };
            for &bus in on {
                manager.config_stream(Endpoint::Master(bus), &cfg, tag).unwrap();
                manager
                    .config_port(Endpoint::Master(bus), &[PortConfig::new(i as u8 + 1, mask)], tag)
                    .unwrap();
            }
            live.push(tag);

            // a failed prepare must leave every bus as it was
            let _ = manager.prepare_and_enable(tag, true);
            check_bandwidth(&manager, &buses, &live)?;
        }

        for (tag, &(_, _, free_running)) in live.clone().into_iter().zip(&streams) {
            if !free_running {
                let _ = manager.disable_and_unprepare(tag, true);
                check_bandwidth(&manager, &buses, &live)?;
            }
            manager.release_stream_tag(tag);
            live.retain(|t| *t != tag);
            check_bandwidth(&manager, &buses, &live)?;
        }
        for bus in buses {
            let state = manager.bus_state(bus).unwrap();
            prop_assert_eq!(state.bandwidth, 0);
            prop_assert!(state.runtimes.is_empty());
        }
    }
}
