//! End-to-end driver pipeline benchmark over the loopback image.
//!
//! Measures what the host-side pipeline costs — fold, pack, device copies,
//! unpack, unfold — plus execution runtime and DRAM bandwidths at one
//! batch size. The loopback image completes transfers synchronously, so
//! every number here is driver overhead; on hardware the runtime column
//! would be dominated by the accelerator itself.
//!
//! ```text
//! cargo run --release --bin bench_pipeline -- --batch 8 --elements 4096
//! ```

use anyhow::Result;
use clap::Parser;
use dataflow_driver::{
    benchmark, Accelerator, Datatype, DriverConfig, IoShapeDescriptor, LoopbackImage, Platform,
    Shape,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bench_pipeline", about = "Driver pipeline benchmark", version)]
struct Cli {
    /// Execution platform protocol (soc or pcie)
    #[arg(long, default_value = "soc")]
    platform: Platform,

    /// Batch size the device buffers are sized for
    #[arg(long, default_value_t = 8)]
    batch: usize,

    /// Elements per sample on the single input/output stream
    #[arg(long, default_value_t = 4096)]
    elements: usize,

    /// Executions to average the runtime over
    #[arg(long, default_value_t = 100)]
    repeats: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    let io = (
        Shape::from([1, cli.elements]),
        Shape::new(vec![1, 1, cli.elements]),
        Shape::new(vec![1, 1, cli.elements]),
    );
    let desc = IoShapeDescriptor::single_io(Datatype::UInt(8), Datatype::UInt(8), io.clone(), io);
    let image = Arc::new(LoopbackImage::for_descriptor(&desc));

    let config = DriverConfig {
        batch_size: cli.batch,
        ..DriverConfig::default()
    };
    let mut driver = Accelerator::new(image, desc, cli.platform, &config)?;

    println!("Pipeline benchmark — loopback image, {} platform protocol", cli.platform);
    println!(
        "stream: {} x {} bytes/sample, {} repeats",
        cli.batch, cli.elements, cli.repeats
    );
    println!();

    let report = benchmark(&mut driver, cli.repeats)?;
    println!("{report}");

    Ok(())
}
