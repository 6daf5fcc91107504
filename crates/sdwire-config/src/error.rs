//! Topology file errors.
//!
//! File access keeps the path it failed on; TOML and validation failures
//! wrap the underlying error as their source.

use crate::validation::ValidationError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a topology could not be loaded, saved or accepted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The topology file could not be read.
    #[error("cannot read topology file '{}'", path.display())]
    Read {
        /// File that was opened.
        path: PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// The topology file could not be written.
    #[error("cannot write topology file '{}'", path.display())]
    Write {
        /// File that was created.
        path: PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// The file is not TOML, or does not match the topology layout.
    #[error("topology is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serializing a topology failed.
    #[error("topology cannot be encoded as TOML: {0}")]
    Encode(#[from] toml::ser::Error),

    /// The file parsed but describes an impossible board.
    #[error("invalid topology: {0}")]
    Invalid(#[from] ValidationError),
}

impl ConfigError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}
