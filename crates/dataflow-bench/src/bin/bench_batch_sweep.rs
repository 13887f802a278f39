//! Batch-size amortization sweep for the driver pipeline.
//!
//! Per-sample cost falls with batch size because the fixed launch and
//! buffer-management overhead amortizes across samples. This sweep resizes
//! one driver through a range of batch sizes and tabulates the curve.
//!
//! ```text
//! cargo run --release --bin bench_batch_sweep -- --elements 4096
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
#[command(name = "bench_batch_sweep", about = "Batch amortization sweep", version)]
struct Cli {
    /// Execution platform protocol (soc or pcie)
    #[arg(long, default_value = "soc")]
    platform: Platform,

    /// Elements per sample on the single input/output stream
    #[arg(long, default_value_t = 4096)]
    elements: usize,

    /// Executions to average each point over
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
    let mut driver = Accelerator::new(image, desc, cli.platform, &DriverConfig::default())?;

    println!("Batch amortization sweep — {} bytes/sample, {} repeats per point", cli.elements, cli.repeats);
    println!();
    println!(
        "  {:>7}  {:>12}  {:>12}  {:>12}  {:>10}",
        "batch", "runtime ms", "µs/sample", "samples/s", "vs batch=1"
    );
    println!("  {:-<7}  {:-<12}  {:-<12}  {:-<12}  {:-<10}", "", "", "", "", "");

    let mut baseline_us: Option<f64> = None;
    for &batch in &[1usize, 2, 4, 8, 16, 32, 64] {
        driver.set_batch_size(batch)?;
        // warmup before the timed repeats
        benchmark(&mut driver, 5)?;
        let report = benchmark(&mut driver, cli.repeats)?;

        #[allow(clippy::cast_precision_loss)]
        let us_per_sample = report.runtime_ms * 1000.0 / batch as f64;
        let baseline = *baseline_us.get_or_insert(us_per_sample);

        println!(
            "  {:>7}  {:>12.3}  {:>12.2}  {:>12.0}  {:>9.2}×",
            batch,
            report.runtime_ms,
            us_per_sample,
            report.throughput_samples_per_s,
            baseline / us_per_sample
        );
    }

    Ok(())
}
