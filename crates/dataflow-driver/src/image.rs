//! Device image capability surface
//!
//! A *device image* is the loaded hardware overlay: an opaque object that
//! can resolve named transfer engines and register partitions, allocate
//! device-visible memory, and service a clock-frequency request. The driver
//! holds one behind [`DeviceImage`] instead of inheriting live hardware
//! handles, so overlay loading stays an external concern and tests can
//! substitute the in-process [`crate::LoopbackImage`].

use crate::error::Result;
use std::fmt::Debug;
use std::sync::Arc;

/// Loaded hardware overlay: engine table, partition table, device memory
pub trait DeviceImage: Debug + Send + Sync {
    /// Resolve a transfer engine by name, `None` if the overlay has no such
    /// engine
    fn engine(&self, name: &str) -> Option<Arc<dyn DmaEngine>>;

    /// Resolve a register partition (one addressable pipeline stage) by
    /// name, `None` if absent
    fn partition(&self, name: &str) -> Option<Arc<dyn RegisterSpace>>;

    /// Allocate a device-visible buffer of `len` bytes with the given cache
    /// policy
    ///
    /// # Errors
    ///
    /// Returns an error if device memory is exhausted.
    fn alloc(&self, len: usize, cacheable: bool) -> Result<Box<dyn DeviceBuffer>>;

    /// Request a fabric clock frequency in MHz
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot honor the request.
    fn request_clock_mhz(&self, mhz: f64) -> Result<()>;

    /// Currently configured fabric clock frequency in MHz
    fn clock_mhz(&self) -> f64;
}

/// One data-movement engine between device memory and a streaming interface
///
/// The driver talks to engines in two disciplines, selected by platform:
/// direct register access (`read_reg`/`write_reg`, polled completion) or an
/// asynchronous `start` returning a completion handle.
pub trait DmaEngine: Debug + Send + Sync {
    /// Read a 32-bit engine register
    fn read_reg(&self, offset: usize) -> u32;

    /// Write a 32-bit engine register
    fn write_reg(&self, offset: usize, value: u32);

    /// Start an asynchronous transfer of `batch_size` samples on `buffer`
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot accept the transfer.
    fn start(
        &self,
        buffer: &dyn DeviceBuffer,
        batch_size: usize,
    ) -> Result<Box<dyn TransferHandle>>;
}

/// Completion token for one asynchronous transfer
///
/// Consumed exactly once by `wait`; dropping a handle without waiting leaves
/// the transfer's buffers in an undefined state (caller contract, not
/// checked at runtime).
pub trait TransferHandle: Debug + Send {
    /// Block until the transfer completes
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer failed.
    fn wait(self: Box<Self>) -> Result<()>;
}

/// Register-mapped address space of one pipeline partition
///
/// Mirrors a memory-mapped 32-bit register file; block helpers cover the
/// word-sequence writes the runtime weight loader performs.
pub trait RegisterSpace: Debug + Send + Sync {
    /// Read a 32-bit word at a byte offset
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit word at a byte offset
    fn write32(&self, offset: usize, value: u32);

    /// Write a contiguous word sequence starting at a byte offset
    fn write_words(&self, offset: usize, words: &[u32]) {
        for (i, &w) in words.iter().enumerate() {
            self.write32(offset + i * 4, w);
        }
    }

    /// Read `count` contiguous words starting at a byte offset
    fn read_words(&self, offset: usize, count: usize) -> Vec<u32> {
        (0..count).map(|i| self.read32(offset + i * 4)).collect()
    }
}

/// Address-stable block of device memory, exclusively owned by its holder
///
/// Dropping the buffer releases the underlying device allocation.
pub trait DeviceBuffer: Debug + Send {
    /// Buffer length in bytes
    fn len(&self) -> usize;

    /// Whether the buffer is zero-sized
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical/device address engines are programmed with
    fn device_address(&self) -> u64;

    /// Cache policy the buffer was allocated with
    fn cacheable(&self) -> bool;

    /// Copy host bytes into the buffer at a byte offset
    ///
    /// # Errors
    ///
    /// Returns an error if the write exceeds the buffer bounds.
    fn write(&self, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy buffer contents out to host memory from a byte offset
    ///
    /// # Errors
    ///
    /// Returns an error if the read exceeds the buffer bounds.
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Push host-cached writes to device (no-op on coherent platforms)
    fn flush(&self);

    /// Discard host-cached reads so the next read observes device writes
    /// (no-op on coherent platforms)
    fn invalidate(&self);
}
