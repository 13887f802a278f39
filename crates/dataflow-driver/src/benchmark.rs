//! Throughput measurement over a live driver
//!
//! Runs repeated executions on generated pattern data and reports end-to-end
//! runtime, sample throughput, DRAM bandwidths, and a per-stage breakdown of
//! the host-side pipeline (measured once, on the first stream). Numbers from
//! the loopback image characterize driver overhead only; on hardware they
//! characterize the accelerator.

#![allow(clippy::cast_precision_loss)]

use crate::datatype::Datatype;
use crate::driver::Accelerator;
use crate::error::{DriverError, Result};
use crate::shapes::Shape;
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::time::Instant;

/// Measured throughput and stage timings for one configuration
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    /// Batch size the measurement ran at
    pub batch_size: usize,
    /// Configured fabric clock in MHz
    pub fclk_mhz: f64,
    /// Mean accelerator runtime per execution, milliseconds
    pub runtime_ms: f64,
    /// Samples per second at the measured runtime
    pub throughput_samples_per_s: f64,
    /// Input stream bandwidth into device memory, MB/s
    pub dram_in_bandwidth_mb_s: f64,
    /// Output stream bandwidth out of device memory, MB/s
    pub dram_out_bandwidth_mb_s: f64,
    /// Per-engine external weight stream bandwidth, MB/s
    pub external_weight_bandwidth_mb_s: BTreeMap<String, f64>,
    /// Host-side fold time for the first input, milliseconds
    pub fold_ms: f64,
    /// Host-side pack time for the first input, milliseconds
    pub pack_ms: f64,
    /// Host-to-device copy time for the first input, milliseconds
    pub copy_to_device_ms: f64,
    /// Device-to-host copy time for the first output, milliseconds
    pub copy_from_device_ms: f64,
    /// Host-side unpack time for the first output, milliseconds
    pub unpack_ms: f64,
    /// Host-side unfold time for the first output, milliseconds
    pub unfold_ms: f64,
}

impl std::fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "batch size            {:>12}", self.batch_size)?;
        writeln!(f, "fclk                  {:>12.1} MHz", self.fclk_mhz)?;
        writeln!(f, "runtime               {:>12.3} ms", self.runtime_ms)?;
        writeln!(
            f,
            "throughput            {:>12.1} samples/s",
            self.throughput_samples_per_s
        )?;
        writeln!(
            f,
            "DRAM in               {:>12.2} MB/s",
            self.dram_in_bandwidth_mb_s
        )?;
        writeln!(
            f,
            "DRAM out              {:>12.2} MB/s",
            self.dram_out_bandwidth_mb_s
        )?;
        for (name, bw) in &self.external_weight_bandwidth_mb_s {
            writeln!(f, "DRAM weights {name:<9}{bw:>12.2} MB/s")?;
        }
        writeln!(f, "fold                  {:>12.3} ms", self.fold_ms)?;
        writeln!(f, "pack                  {:>12.3} ms", self.pack_ms)?;
        writeln!(f, "copy to device        {:>12.3} ms", self.copy_to_device_ms)?;
        writeln!(f, "copy from device      {:>12.3} ms", self.copy_from_device_ms)?;
        writeln!(f, "unpack                {:>12.3} ms", self.unpack_ms)?;
        write!(f, "unfold                {:>12.3} ms", self.unfold_ms)
    }
}

/// Deterministic test tensor cycling through the datatype's value range
#[must_use]
pub fn pattern_tensor(dt: Datatype, shape: Shape) -> Tensor {
    if dt == Datatype::Bipolar {
        return Tensor::from_fn(shape, |i| if i % 2 == 0 { -1 } else { 1 });
    }
    let min = dt.min();
    let span = dt.max() - min + 1;
    Tensor::from_fn(shape, |i| min + (i as i64) % span)
}

fn ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Measure `repeats` executions on pattern inputs at the current batch size
///
/// # Errors
///
/// Returns [`DriverError::Configuration`] for zero repeats and propagates
/// every pipeline stage's errors.
pub fn benchmark(driver: &mut Accelerator, repeats: usize) -> Result<BenchmarkReport> {
    if repeats == 0 {
        return Err(DriverError::configuration(
            "benchmark needs at least one repeat",
        ));
    }
    let batch = driver.batch_size();
    let desc = driver.descriptor().clone();

    let mut fold_ms = 0.0;
    let mut pack_ms = 0.0;
    let mut copy_to_device_ms = 0.0;
    let mut in_bytes = 0usize;
    for ind in 0..desc.num_inputs() {
        let tensor = pattern_tensor(desc.idt(ind)?, desc.ishape_normal(ind, batch)?);

        let t0 = Instant::now();
        let folded = driver.fold_input(tensor, ind)?;
        let t1 = Instant::now();
        let packed = driver.pack_input(&folded, ind)?;
        let t2 = Instant::now();
        driver.copy_input_to_device(ind, &packed)?;
        if ind == 0 {
            fold_ms = t1.duration_since(t0).as_secs_f64() * 1000.0;
            pack_ms = t2.duration_since(t1).as_secs_f64() * 1000.0;
            copy_to_device_ms = ms(t2);
        }
        in_bytes += packed.len();
    }

    let start = Instant::now();
    for _ in 0..repeats {
        driver.execute_on_buffers(false, None)?;
    }
    let runtime_ms = ms(start) / repeats as f64;
    let runtime_s = runtime_ms / 1000.0;

    let mut copy_from_device_ms = 0.0;
    let mut unpack_ms = 0.0;
    let mut unfold_ms = 0.0;
    let mut out_bytes = 0usize;
    for ind in 0..desc.num_outputs() {
        out_bytes += desc.oshape_packed(ind, batch)?.total_elements();
        let t0 = Instant::now();
        let bytes = driver.copy_output_from_device(ind)?;
        let t1 = Instant::now();
        let folded = driver.unpack_output(&bytes, ind)?;
        let t2 = Instant::now();
        driver.unfold_output(folded, ind)?;
        if ind == 0 {
            copy_from_device_ms = t1.duration_since(t0).as_secs_f64() * 1000.0;
            unpack_ms = t2.duration_since(t1).as_secs_f64() * 1000.0;
            unfold_ms = ms(t2);
        }
    }

    // each execution streams the full weight once per batch sample
    let external_weight_bandwidth_mb_s = driver
        .external_weights()
        .iter()
        .map(|w| {
            let streamed = batch as f64 * w.buffer.len() as f64;
            (w.name.clone(), streamed / runtime_s / 1e6)
        })
        .collect();

    Ok(BenchmarkReport {
        batch_size: batch,
        fclk_mhz: driver.clock_mhz(),
        runtime_ms,
        throughput_samples_per_s: batch as f64 / runtime_s,
        dram_in_bandwidth_mb_s: in_bytes as f64 / runtime_s / 1e6,
        dram_out_bandwidth_mb_s: out_bytes as f64 / runtime_s / 1e6,
        external_weight_bandwidth_mb_s,
        fold_ms,
        pack_ms,
        copy_to_device_ms,
        copy_from_device_ms,
        unpack_ms,
        unfold_ms,
    })
}
