//! Topology validation.
//!
//! Catches problems the bus manager would otherwise report one at a time
//! halfway through bring-up: duplicate names, dangling references, ports a
//! device does not have and streams whose rate cannot be carried by the
//! master's clock.
//!
//! # Example
//!
//! ```rust
//! use sdwire_config::{MasterConfig, Topology, validate_topology};
//!
//! let topology = Topology::new().with_master(MasterConfig::new("link0", 24_576_000));
//! validate_topology(&topology).expect("a bare master is valid");
//! ```

use sdwire_core::regs::MAX_DEVICES;
use std::collections::HashSet;
use thiserror::Error;

use crate::topology::{StreamScenario, Topology};

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Two masters, slaves or streams share a name.
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName {
        /// What was named twice: master, slave or stream.
        kind: &'static str,
        /// The repeated name.
        name: String,
    },

    /// A stream names a master or slave that does not exist.
    #[error("stream '{stream}' refers to unknown {kind} '{name}'")]
    UnknownReference {
        /// Stream holding the reference.
        stream: String,
        /// Master or slave.
        kind: &'static str,
        /// The missing name.
        name: String,
    },

    /// A master is misconfigured.
    #[error("master '{master}': {reason}")]
    InvalidMaster {
        /// Master name.
        master: String,
        /// What is wrong.
        reason: String,
    },

    /// A slave is misconfigured.
    #[error("slave '{slave}': {reason}")]
    InvalidSlave {
        /// Slave name.
        slave: String,
        /// What is wrong.
        reason: String,
    },

    /// A stream is misconfigured.
    #[error("stream '{stream}': {reason}")]
    InvalidStream {
        /// Stream name.
        stream: String,
        /// What is wrong.
        reason: String,
    },

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Check a whole topology, reporting every problem found.
pub fn validate_topology(topology: &Topology) -> ValidationResult<()> {
    let mut errors = Vec::new();

    check_names(topology, &mut errors);
    check_masters(topology, &mut errors);
    for stream in &topology.streams {
        check_stream(topology, stream, &mut errors);
    }

    let shared_keys: HashSet<&str> = topology
        .streams
        .iter()
        .filter_map(|s| s.key.as_deref())
        .collect();
    let unkeyed = topology.streams.iter().filter(|s| s.key.is_none()).count();
    let tags_needed = shared_keys.len() + unkeyed;
    if tags_needed > topology.tuning.num_stream_tags {
        errors.push(ValidationError::InvalidStream {
            stream: "*".to_string(),
            reason: format!(
                "{tags_needed} streams need tags but the pool holds {}",
                topology.tuning.num_stream_tags
            ),
        });
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

fn check_names(topology: &Topology, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for master in &topology.masters {
        if !seen.insert(master.name.as_str()) {
            errors.push(ValidationError::DuplicateName {
                kind: "master",
                name: master.name.clone(),
            });
        }
    }

    let mut seen = HashSet::new();
    let mut ids = HashSet::new();
    for slave in topology.masters.iter().flat_map(|m| &m.slaves) {
        if !seen.insert(slave.name.as_str()) {
            errors.push(ValidationError::DuplicateName {
                kind: "slave",
                name: slave.name.clone(),
            });
        }
        if !ids.insert(slave.dev_id) {
            errors.push(ValidationError::InvalidSlave {
                slave: slave.name.clone(),
                reason: format!("device ID {} is already in use", slave.dev_id),
            });
        }
    }

    let mut seen = HashSet::new();
    for stream in &topology.streams {
        if !seen.insert(stream.name.as_str()) {
            errors.push(ValidationError::DuplicateName {
                kind: "stream",
                name: stream.name.clone(),
            });
        }
    }
}

fn check_masters(topology: &Topology, errors: &mut Vec<ValidationError>) {
    for master in &topology.masters {
        if let Err(e) = master.capability().validate() {
            errors.push(ValidationError::InvalidMaster {
                master: master.name.clone(),
                reason: e.to_string(),
            });
        }
        if master.slaves.len() > usize::from(MAX_DEVICES) {
            errors.push(ValidationError::InvalidMaster {
                master: master.name.clone(),
                reason: format!(
                    "{} slaves attached, a link numbers at most {MAX_DEVICES}",
                    master.slaves.len()
                ),
            });
        }
        for slave in &master.slaves {
            if let Err(e) = slave.caps.validate() {
                errors.push(ValidationError::InvalidSlave {
                    slave: slave.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

fn check_stream(topology: &Topology, stream: &StreamScenario, errors: &mut Vec<ValidationError>) {
    let invalid = |reason: String| ValidationError::InvalidStream {
        stream: stream.name.clone(),
        reason,
    };

    if stream.rate == 0 || stream.channels == 0 || stream.bps == 0 {
        errors.push(invalid(
            "rate, channels and bps must all be nonzero".to_string(),
        ));
    }
    if stream.masters.is_empty() {
        errors.push(invalid("no master endpoint".to_string()));
    }

    let mut buses = HashSet::new();
    for endpoint in &stream.masters {
        let Some(master) = topology.master(&endpoint.master) else {
            errors.push(ValidationError::UnknownReference {
                stream: stream.name.clone(),
                kind: "master",
                name: endpoint.master.clone(),
            });
            continue;
        };
        buses.insert(master.name.as_str());

        if stream.rate != 0 && (u64::from(master.base_clk_freq) * 2) % u64::from(stream.rate) != 0
        {
            errors.push(invalid(format!(
                "rate {} Hz does not divide the clock of '{}'",
                stream.rate, master.name
            )));
        }
        if endpoint.ports.is_empty() {
            errors.push(invalid(format!("no ports on master '{}'", master.name)));
        }
        for port in &endpoint.ports {
            if port.ch_mask == 0 {
                errors.push(invalid(format!(
                    "empty channel mask on master '{}' port {}",
                    master.name, port.port
                )));
            }
            if master.capability().port(port.port).is_none() {
                errors.push(invalid(format!(
                    "master '{}' has no port {}",
                    master.name, port.port
                )));
            }
        }
    }

    for endpoint in &stream.slaves {
        let Some((master, slave)) = topology.slave(&endpoint.slave) else {
            errors.push(ValidationError::UnknownReference {
                stream: stream.name.clone(),
                kind: "slave",
                name: endpoint.slave.clone(),
            });
            continue;
        };
        if !buses.contains(master.name.as_str()) {
            errors.push(invalid(format!(
                "slave '{}' sits on '{}' which carries no master endpoint",
                slave.name, master.name
            )));
        }
        if endpoint.ports.is_empty() {
            errors.push(invalid(format!("no ports on slave '{}'", slave.name)));
        }
        for port in &endpoint.ports {
            if port.ch_mask == 0 {
                errors.push(invalid(format!(
                    "empty channel mask on slave '{}' port {}",
                    slave.name, port.port
                )));
            }
            if slave.caps.port(port.port).is_none() {
                errors.push(invalid(format!(
                    "slave '{}' has no port {}",
                    slave.name, port.port
                )));
            }
        }
    }
}
