//! sdwire Core - SoundWire bus bandwidth and transport management
//!
//! This crate decides how audio streams share a SoundWire bus: which bus
//! clock and frame shape to run, where each stream's samples sit in the
//! frame, and in which order registers are written so that running streams
//! never glitch when another stream joins or leaves.
//!
//! # Core Abstractions
//!
//! ## Streams
//!
//! - [`BusManager`] - Entry point: buses, slaves, stream tags and lifecycle
//! - [`Stream`] - One audio flow spanning one or more buses
//! - [`MasterRuntime`] / [`SlaveRuntime`] - Per-bus and per-peripheral state
//! - [`StreamState`] - `Config -> Prepare -> Enable -> Disable -> Unprepare`
//!
//! ## Bus Configuration
//!
//! - [`solver`] - Clock, frame shape and horizontal window selection
//! - [`frame`] - Legal frame shapes and their register encoding
//! - [`Banked`] - Live and staged register banks
//!
//! ## Controllers and Devices
//!
//! - [`MasterOps`] - Trait implemented by bus controllers
//! - [`SlaveDriver`] - Optional peripheral driver callbacks
//! - [`SimController`] - In-memory controller for tests and tooling
//! - [`regs`] - SoundWire 1.x register map
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sdwire_core::{
//!     BusManager, CoreConfig, Direction, Endpoint, MasterCapability, PortCapability,
//!     PortConfig, SimController, StreamConfig,
//! };
//!
//! let manager = BusManager::new(CoreConfig::instant());
//! let caps = MasterCapability::new(24_576_000).with_port(PortCapability::new(1));
//! let bus = manager.add_master(caps, Arc::new(SimController::new())).unwrap();
//!
//! let tag = manager.alloc_stream_tag(None).unwrap();
//! let config = StreamConfig::new(48_000, 2, 16, Direction::Out);
//! manager.config_stream(Endpoint::Master(bus), &config, tag).unwrap();
//! manager.config_port(Endpoint::Master(bus), &[PortConfig::new(1, 0x3)], tag).unwrap();
//! manager.prepare_and_enable(tag, true).unwrap();
//!
//! let state = manager.bus_state(bus).unwrap();
//! assert_eq!(state.bandwidth, 1_536_000);
//! assert_eq!(state.clk_freq, 49_152_000);
//! ```

pub mod bank;
pub mod bra;
pub mod bus;
pub mod caps;
pub mod config;
pub mod error;
pub mod frame;
mod lifecycle;
pub mod manager;
pub mod registry;
pub mod regs;
pub mod sim;
pub mod slave;
pub mod solver;
mod status;
pub mod stream;
pub mod transfer;

pub use bank::{Bank, Banked};
pub use bra::{BraBlock, BraOp};
pub use bus::{BankImage, Bus, BusId, BusState, ClockStopMode};
pub use caps::{
    AudioMode, ChannelPrepare, MasterCapability, PortCapability, PortDirection, SlaveCapability,
    Support,
};
pub use config::CoreConfig;
pub use error::{Error, Result};
pub use frame::FrameShape;
pub use manager::BusManager;
pub use sim::{MasterCall, SimController};
pub use slave::{
    AlertCounters, DevId, ImplDefStatus, SlaveDriver, SlaveId, SlaveInfo, SlaveStatus,
    StatusReport,
};
pub use stream::{
    Direction, Endpoint, MasterRuntime, PortConfig, PortParams, PortRuntime, SlaveRuntime, Stream,
    StreamConfig, StreamKind, StreamParams, StreamState, StreamTag, TransportParams,
};
pub use transfer::{Completion, MasterOps, Msg, MsgFlag, PrepareCh, TransferContext, XferError};
