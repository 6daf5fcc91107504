//! Check a topology file.

use clap::Args;
use std::path::PathBuf;

use super::common::load_topology;

/// Check a topology file for errors.
#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the topology TOML file
    pub file: PathBuf,
}

/// Run the validate command.
pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let topology = load_topology(&args.file)?;

    let slaves: usize = topology.masters.iter().map(|m| m.slaves.len()).sum();
    println!("Topology:  {}", args.file.display());
    println!("Masters:   {}", topology.masters.len());
    println!("Slaves:    {slaves}");
    println!("Streams:   {}", topology.streams.len());
    println!("OK");

    Ok(())
}
