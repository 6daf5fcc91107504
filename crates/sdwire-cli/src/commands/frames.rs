//! List legal frame shapes.

use clap::Args;
use sdwire_core::frame::{self, FrameShape};

/// List legal frame shapes and their register encoding.
#[derive(Args)]
pub struct FramesArgs {
    /// Only list shapes that divide this bus clock (Hz), with their frame rate
    #[arg(long)]
    pub clock: Option<u32>,

    /// Only list shapes with at least this many payload bits per frame
    #[arg(long, default_value = "0")]
    pub min_payload: u32,
}

/// Run the frames command.
pub fn run(args: FramesArgs) -> anyhow::Result<()> {
    if args.clock == Some(0) {
        anyhow::bail!("clock must be nonzero");
    }

    let mut shapes: Vec<FrameShape> = frame::candidates()
        .filter(|f| f.data_bits() >= args.min_payload)
        .filter(|f| args.clock.is_none_or(|clk| clk % f.interval() == 0))
        .collect();
    shapes.sort_by_key(|f| (f.cols, f.rows));

    println!("Legal Frame Shapes");
    println!("==================");
    println!();
    println!(
        "{:<8} {:>5} {:>5} {:>6} {:>8} {:>10}",
        "Shape", "Rows", "Cols", "Bits", "Payload", "FRAMECTRL"
    );
    for shape in &shapes {
        let code = shape
            .encode()
            .map_or_else(|| "-".to_string(), |c| format!("{c:#04x}"));
        print!(
            "{:<8} {:>5} {:>5} {:>6} {:>8} {:>10}",
            shape.to_string(),
            shape.rows,
            shape.cols,
            shape.interval(),
            shape.data_bits(),
            code
        );
        if let Some(clk) = args.clock {
            print!("  {} Hz", clk / shape.interval());
        }
        println!();
    }
    println!();
    println!("{} shapes", shapes.len());

    Ok(())
}
