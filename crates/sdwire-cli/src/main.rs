//! sdwire CLI - plan and check SoundWire bus topologies.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sdwire")]
#[command(author, version, about = "SoundWire bus bandwidth planner", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a topology file for errors
    Validate(commands::validate::ValidateArgs),

    /// Bring up a topology on simulated links and report the bus configuration
    Solve(commands::solve::SolveArgs),

    /// List legal frame shapes and their register encoding
    Frames(commands::frames::FramesArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Solve(args) => commands::solve::run(args),
        Commands::Frames(args) => commands::frames::run(args),
    }
}
