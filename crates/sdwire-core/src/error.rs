//! Error types for bus, stream and transfer operations.

use crate::transfer::XferError;
use thiserror::Error;

/// Errors returned by the bus manager and its components.
#[derive(Debug, Error)]
pub enum Error {
    /// A fixed-size pool ran out of entries
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Bad handle, mismatched parameters or an infeasible bus configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A register transfer or controller callback failed
    #[error("transfer failed during {context}: {source}")]
    Io {
        /// What the core was doing when the transfer failed.
        context: String,
        /// Failure reported by the controller.
        #[source]
        source: XferError,
    },

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The bus lock is held and the caller asked not to block
    #[error("bus lock held, transfer would block")]
    WouldBlock,

    /// The bus is in use and cannot serve the request
    #[error("bus busy: {0}")]
    Busy(String),

    /// The slave-status worker thread could not be spawned
    #[error("failed to spawn status worker: {0}")]
    Worker(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid-argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create a transfer error with the operation that triggered it.
    pub fn io(context: impl Into<String>, source: XferError) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a timeout error naming what was awaited.
    pub fn timeout(what: impl Into<String>) -> Self {
        Error::Timeout(what.into())
    }

    /// Create a busy error.
    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
