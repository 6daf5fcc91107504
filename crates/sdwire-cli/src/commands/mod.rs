//! CLI command implementations.

pub mod common;
pub mod frames;
pub mod solve;
pub mod validate;
