//! Top-level accelerator driver
//!
//! [`Accelerator`] ties the whole pipeline together: it resolves the
//! descriptor's transfer engines against a loaded [`DeviceImage`],
//! allocates the per-stream device buffers, loads external and runtime
//! weights, and exposes [`Accelerator::run`] — fold, pack, copy in,
//! execute, copy out, unpack, unfold — plus the lower-level steps for
//! callers that want to drive them separately.

use crate::buffers::BufferManager;
use crate::error::{DriverError, Result};
use crate::exec::{ExecutionEngine, Platform};
use crate::external_weights::{load_external_weights, ExternalWeightBinding};
use crate::image::DeviceImage;
use crate::packing;
use crate::runtime_weights::load_runtime_weights;
use crate::shapes::IoShapeDescriptor;
use crate::tensor::Tensor;
use std::path::PathBuf;
use std::sync::Arc;

/// Runtime configuration for a driver instance
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Batch capacity the buffers are sized for; must be at least 1
    pub batch_size: usize,
    /// Fabric clock request in MHz, applied on `soc` platforms; 0 leaves
    /// the image's clock untouched
    pub fclk_mhz: f64,
    /// Directory scanned for `<engine>.npy` external weights and
    /// `<sdp>_<layer>_*.dat` runtime weights; `None` skips weight loading
    pub weight_dir: Option<PathBuf>,
    /// Read runtime weights back after writing and fail on a mismatch
    pub verify_runtime_weights: bool,
    /// Run one dummy execution after runtime weights were written, so the
    /// fabric latches the new parameters before real inputs arrive
    pub flush_after_weights: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            fclk_mhz: 0.0,
            weight_dir: None,
            verify_runtime_weights: true,
            flush_after_weights: true,
        }
    }
}

/// Driver for one loaded dataflow accelerator
#[derive(Debug)]
pub struct Accelerator {
    image: Arc<dyn DeviceImage>,
    descriptor: IoShapeDescriptor,
    batch_size: usize,
    buffers: BufferManager,
    engine: ExecutionEngine,
    external_weights: Vec<ExternalWeightBinding>,
}

impl Accelerator {
    /// Bring up a driver over a loaded device image
    ///
    /// Validates the descriptor, resolves every named transfer engine,
    /// applies the clock request, allocates device buffers for the
    /// configured batch size, then loads external and runtime weights from
    /// `config.weight_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] for an inconsistent
    /// descriptor, a zero batch size, or a weight-count mismatch;
    /// [`DriverError::EngineNotFound`] when the image lacks a named engine;
    /// [`DriverError::DataIntegrity`] when runtime weight verification
    /// fails.
    pub fn new(
        image: Arc<dyn DeviceImage>,
        descriptor: IoShapeDescriptor,
        platform: Platform,
        config: &DriverConfig,
    ) -> Result<Self> {
        descriptor.validate()?;
        if config.batch_size == 0 {
            return Err(DriverError::configuration("batch size must be at least 1"));
        }

        let idma = descriptor
            .input_dma_names
            .iter()
            .map(|n| image.engine(n).ok_or_else(|| DriverError::engine_not_found(n)))
            .collect::<Result<Vec<_>>>()?;
        let odma = descriptor
            .output_dma_names
            .iter()
            .map(|n| image.engine(n).ok_or_else(|| DriverError::engine_not_found(n)))
            .collect::<Result<Vec<_>>>()?;

        if platform == Platform::Soc && config.fclk_mhz > 0.0 {
            image.request_clock_mhz(config.fclk_mhz)?;
        }

        let mut buffers = BufferManager::new(Arc::clone(&image), platform.cacheable_buffers());
        buffers.reallocate(&descriptor, config.batch_size)?;

        let mut driver = Self {
            image,
            descriptor,
            batch_size: config.batch_size,
            buffers,
            engine: ExecutionEngine::new(platform, idma, odma),
            external_weights: Vec::new(),
        };

        if let Some(dir) = &config.weight_dir {
            driver.external_weights = load_external_weights(
                &driver.image,
                dir,
                platform.cacheable_buffers(),
                driver.descriptor.num_external_weights,
            )?;
            let written =
                load_runtime_weights(&driver.image, dir, config.verify_runtime_weights)?;
            if written > 0 && config.flush_after_weights {
                // dummy execution latches the freshly written parameters
                driver.execute_on_buffers(false, None)?;
            }
        }

        tracing::info!(
            platform = %platform,
            batch_size = driver.batch_size,
            inputs = driver.descriptor.num_inputs(),
            outputs = driver.descriptor.num_outputs(),
            external_weights = driver.external_weights.len(),
            fclk_mhz = driver.image.clock_mhz(),
            "accelerator driver ready"
        );
        Ok(driver)
    }

    /// Platform the driver executes on
    pub const fn platform(&self) -> Platform {
        self.engine.platform()
    }

    /// Batch capacity the device buffers are currently sized for
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Configured fabric clock in MHz
    pub fn clock_mhz(&self) -> f64 {
        self.image.clock_mhz()
    }

    /// The descriptor this driver was built from
    pub const fn descriptor(&self) -> &IoShapeDescriptor {
        &self.descriptor
    }

    /// External weight bindings discovered at bring-up
    pub fn external_weights(&self) -> &[ExternalWeightBinding] {
        &self.external_weights
    }

    /// Resize the batch capacity, releasing and reallocating every device
    /// buffer
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] for a zero batch size and
    /// allocation errors from the image.
    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(DriverError::configuration("batch size must be at least 1"));
        }
        self.buffers.reallocate(&self.descriptor, batch_size)?;
        self.batch_size = batch_size;
        Ok(())
    }

    /// Bring an input tensor from its normal shape to its folded shape
    ///
    /// The tensor must be in exactly the normal shape at the current batch
    /// size; the data is moved, not copied.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ShapeMismatch`] for any other shape.
    pub fn fold_input(&self, tensor: Tensor, ind: usize) -> Result<Tensor> {
        let normal = self.descriptor.ishape_normal(ind, self.batch_size)?;
        if *tensor.shape() != normal {
            return Err(DriverError::ShapeMismatch {
                expected: normal,
                actual: tensor.shape().clone(),
            });
        }
        tensor.reshape(self.descriptor.ishape_folded(ind, self.batch_size)?)
    }

    /// Pack a folded input tensor into the device byte stream
    ///
    /// # Errors
    ///
    /// Propagates packing errors (unsupported datatype, out-of-range
    /// element values).
    pub fn pack_input(&self, tensor: &Tensor, ind: usize) -> Result<Vec<u8>> {
        packing::pack(tensor, self.descriptor.idt(ind)?, true, true)
    }

    /// Copy a packed input stream into its device buffer
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if the byte count does not
    /// match the buffer size.
    pub fn copy_input_to_device(&mut self, ind: usize, packed: &[u8]) -> Result<()> {
        self.buffers.copy_to_device(ind, packed)
    }

    /// Copy the packed output stream out of its device buffer
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn copy_output_from_device(&mut self, ind: usize) -> Result<Vec<u8>> {
        Ok(self.buffers.copy_from_device(ind)?.to_vec())
    }

    /// Unpack a packed output stream into a folded tensor
    ///
    /// # Errors
    ///
    /// Propagates unpacking errors (unsupported datatype, wrong stream
    /// length).
    pub fn unpack_output(&self, bytes: &[u8], ind: usize) -> Result<Tensor> {
        packing::unpack(
            bytes,
            self.descriptor.odt(ind)?,
            &self.descriptor.oshape_folded(ind, self.batch_size)?,
            true,
            true,
        )
    }

    /// Read back the device output stream and unpack it to a folded tensor
    ///
    /// # Errors
    ///
    /// Propagates buffer and unpacking errors.
    pub fn read_output(&mut self, ind: usize) -> Result<Tensor> {
        let bytes = self.copy_output_from_device(ind)?;
        self.unpack_output(&bytes, ind)
    }

    /// Reshape a folded output tensor to its normal shape
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ShapeMismatch`] if the tensor is not in the
    /// folded output shape.
    pub fn unfold_output(&self, tensor: Tensor, ind: usize) -> Result<Tensor> {
        let folded = self.descriptor.oshape_folded(ind, self.batch_size)?;
        if *tensor.shape() != folded {
            return Err(DriverError::ShapeMismatch {
                expected: folded,
                actual: tensor.shape().clone(),
            });
        }
        tensor.reshape(self.descriptor.oshape_normal(ind, self.batch_size)?)
    }

    /// Launch the accelerator on whatever the device buffers hold
    ///
    /// `batch_size` defaults to the full buffer capacity; a smaller value
    /// transfers only the leading samples. With `asynch` the call returns
    /// after launch and [`Self::wait`] must be called before reading
    /// outputs.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] for a zero or over-capacity
    /// batch size, or when an overlapping execution is detected.
    pub fn execute_on_buffers(&mut self, asynch: bool, batch_size: Option<usize>) -> Result<()> {
        let bs = batch_size.unwrap_or(self.batch_size);
        if bs == 0 || bs > self.batch_size {
            return Err(DriverError::precondition(format!(
                "requested batch {bs} outside buffer capacity 1..={}",
                self.batch_size
            )));
        }
        self.engine
            .launch(&self.buffers, &self.external_weights, bs)?;
        if !asynch {
            self.engine.wait()?;
        }
        Ok(())
    }

    /// Block until the in-flight execution completes
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] on `pcie` when nothing is in
    /// flight.
    pub fn wait(&mut self) -> Result<()> {
        self.engine.wait()
    }

    /// Full synchronous inference: one tensor per input stream in, one
    /// tensor per output stream out
    ///
    /// Inputs must be in normal shape; outputs come back in normal shape.
    /// Always returns exactly `num_outputs` tensors.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] for a wrong input count and
    /// propagates every pipeline stage's errors.
    pub fn run(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        if inputs.len() != self.descriptor.num_inputs() {
            return Err(DriverError::precondition(format!(
                "got {} input tensors, accelerator has {} input streams",
                inputs.len(),
                self.descriptor.num_inputs()
            )));
        }
        for (ind, tensor) in inputs.into_iter().enumerate() {
            let folded = self.fold_input(tensor, ind)?;
            let packed = self.pack_input(&folded, ind)?;
            self.buffers.copy_to_device(ind, &packed)?;
        }
        self.execute_on_buffers(false, None)?;
        let mut outputs = Vec::with_capacity(self.descriptor.num_outputs());
        for ind in 0..self.descriptor.num_outputs() {
            let folded = self.read_output(ind)?;
            outputs.push(self.unfold_output(folded, ind)?);
        }
        tracing::debug!(batch_size = self.batch_size, "inference complete");
        Ok(outputs)
    }
}
