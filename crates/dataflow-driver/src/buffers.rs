//! Double-buffered device memory for accelerator I/O
//!
//! The [`BufferManager`] owns one packed device buffer per input and output
//! stream, sized from the descriptor's packed shapes at the current batch
//! size, plus one host-resident shadow buffer per output that receives DMA
//! results before unpacking. Changing the batch size releases every held
//! buffer before allocating replacements, so old and new allocations never
//! alias even under eager reclamation.

use crate::error::{DriverError, Result};
use crate::image::{DeviceBuffer, DeviceImage};
use crate::shapes::IoShapeDescriptor;
use std::sync::Arc;

/// Owner of the input/output device buffer pairs
#[derive(Debug)]
pub struct BufferManager {
    image: Arc<dyn DeviceImage>,
    cacheable: bool,
    ibufs: Vec<Box<dyn DeviceBuffer>>,
    obufs: Vec<Box<dyn DeviceBuffer>>,
    oshadow: Vec<Vec<u8>>,
}

impl BufferManager {
    /// Create an empty manager; call [`Self::reallocate`] before use
    ///
    /// `cacheable` is the platform-wide cache policy applied to every
    /// buffer (cacheable for on-chip DMA platforms, non-cacheable for
    /// discrete cards).
    pub fn new(image: Arc<dyn DeviceImage>, cacheable: bool) -> Self {
        Self {
            image,
            cacheable,
            ibufs: Vec::new(),
            obufs: Vec::new(),
            oshadow: Vec::new(),
        }
    }

    /// Release all held buffers and allocate fresh ones for `batch_size`
    ///
    /// # Errors
    ///
    /// Returns an error if device memory allocation fails; the manager is
    /// left empty in that case.
    pub fn reallocate(&mut self, desc: &IoShapeDescriptor, batch_size: usize) -> Result<()> {
        // Old buffers must be gone before the image hands out new ones.
        self.ibufs.clear();
        self.obufs.clear();
        self.oshadow.clear();

        for i in 0..desc.num_inputs() {
            let len = desc.ishape_packed(i, batch_size)?.total_elements();
            self.ibufs.push(self.image.alloc(len, self.cacheable)?);
        }
        for o in 0..desc.num_outputs() {
            let len = desc.oshape_packed(o, batch_size)?.total_elements();
            self.obufs.push(self.image.alloc(len, self.cacheable)?);
            self.oshadow.push(vec![0u8; len]);
        }
        tracing::debug!(
            batch_size,
            inputs = self.ibufs.len(),
            outputs = self.obufs.len(),
            "reallocated device buffers"
        );
        Ok(())
    }

    /// Device input buffer for stream `ind`
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range or
    /// buffers were never allocated.
    pub fn input(&self, ind: usize) -> Result<&dyn DeviceBuffer> {
        self.ibufs
            .get(ind)
            .map(AsRef::as_ref)
            .ok_or_else(|| DriverError::precondition(format!("no input buffer at index {ind}")))
    }

    /// Device output buffer for stream `ind`
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range or
    /// buffers were never allocated.
    pub fn output(&self, ind: usize) -> Result<&dyn DeviceBuffer> {
        self.obufs
            .get(ind)
            .map(AsRef::as_ref)
            .ok_or_else(|| DriverError::precondition(format!("no output buffer at index {ind}")))
    }

    /// Write packed bytes into the device input buffer and flush it
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if the byte count does not
    /// match the buffer size.
    pub fn copy_to_device(&mut self, ind: usize, packed: &[u8]) -> Result<()> {
        let buf = self.input(ind)?;
        if packed.len() != buf.len() {
            return Err(DriverError::precondition(format!(
                "packed input {ind} is {} bytes but device buffer holds {}",
                packed.len(),
                buf.len()
            )));
        }
        buf.write(0, packed)?;
        buf.flush();
        Ok(())
    }

    /// Invalidate the device output buffer and copy it into the host shadow
    ///
    /// Returns the shadow slice; it stays valid until the next copy or
    /// reallocation.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn copy_from_device(&mut self, ind: usize) -> Result<&[u8]> {
        let buf = self.obufs.get(ind).map(AsRef::as_ref).ok_or_else(|| {
            DriverError::precondition(format!("no output buffer at index {ind}"))
        })?;
        buf.invalidate();
        buf.read(0, &mut self.oshadow[ind])?;
        Ok(&self.oshadow[ind])
    }
}
