//! Topology files for sdwire.
//!
//! A topology describes a board: the bus masters, the slaves wired to each
//! link with their capabilities, and the streams to run across them. It is
//! stored as TOML and checked before anything reaches the bus manager.
//!
//! # Features
//!
//! - **Topology files**: Load and save boards as TOML
//! - **Validation**: Report every naming, reference and port problem at once
//! - **Tuning**: Override [`CoreConfig`](sdwire_core::CoreConfig) timeouts per board
//!
//! # Example
//!
//! ```rust
//! use sdwire_config::{MasterConfig, PortUse, StreamScenario, Topology, validate_topology};
//! use sdwire_core::PortCapability;
//!
//! let topology = Topology::new()
//!     .with_master(MasterConfig::new("link0", 24_576_000).with_port(PortCapability::new(1)))
//!     .with_stream(
//!         StreamScenario::new("playback", 48_000, 2, 16)
//!             .with_master("link0", vec![PortUse::new(1, 0x3)]),
//!     );
//! validate_topology(&topology).unwrap();
//!
//! let text = topology.to_toml().unwrap();
//! assert_eq!(Topology::from_toml(&text).unwrap(), topology);
//! ```

mod error;
mod topology;

/// Topology validation.
pub mod validation;

pub use error::ConfigError;
pub use topology::{
    MasterConfig, MasterEndpoint, PortUse, SlaveConfig, SlaveEndpoint, StreamScenario, Topology,
};
pub use validation::{ValidationError, ValidationResult, validate_topology};
