//! Runtime driver for streaming dataflow accelerators.
//!
//! A dataflow accelerator is a hardware pipeline that consumes and produces
//! quantized tensors as packed byte streams. This crate is the host side of
//! that contract: it reshapes application tensors into the hardware's
//! folded layout, bit-packs them, moves them through DMA engines, runs the
//! accelerator, and turns the result stream back into tensors.
//!
//! # Architecture
//!
//! ```text
//! Tensor ─ fold ─ pack ─┐                       ┌─ unpack ─ unfold ─ Tensor
//!                       ▼                       │
//!              [input device buffer] ─► HW ─► [output device buffer]
//!                       ▲
//!          external / runtime weights
//! ```
//!
//! The hardware is reached through the [`DeviceImage`] capability trait, so
//! the same driver runs against a memory-mapped overlay or the in-process
//! [`LoopbackImage`] used by tests and benchmarks. Two execution protocols
//! are supported, selected by [`Platform`]: register-polled on-chip DMA
//! (`soc`) and handle-based transfers on discrete cards (`pcie`).
//!
//! # Quick start
//!
//! ```
//! use dataflow_driver::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let desc = IoShapeDescriptor::single_io(
//!     Datatype::UInt(8),
//!     Datatype::UInt(8),
//!     (Shape::from([1, 4]), Shape::from([1, 1, 4]), Shape::from([1, 1, 4])),
//!     (Shape::from([1, 4]), Shape::from([1, 1, 4]), Shape::from([1, 1, 4])),
//! );
//! let image = Arc::new(LoopbackImage::for_descriptor(&desc));
//! let mut driver = Accelerator::new(image, desc, Platform::Soc, &DriverConfig::default())?;
//!
//! let input = Tensor::new(vec![10, 20, 30, 40], Shape::from([1, 4]))?;
//! let outputs = driver.run(vec![input])?;
//! assert_eq!(outputs[0].data(), &[10, 20, 30, 40]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod benchmark;
mod buffers;
mod datatype;
mod driver;
mod error;
pub mod exec;
pub mod image;
mod loopback;
pub mod packing;
mod shapes;
mod tensor;
pub mod weight_files;

mod external_weights;
mod runtime_weights;

pub use benchmark::{benchmark, pattern_tensor, BenchmarkReport};
pub use buffers::BufferManager;
pub use datatype::Datatype;
pub use driver::{Accelerator, DriverConfig};
pub use error::{DriverError, Result};
pub use exec::Platform;
pub use external_weights::{load_external_weights, ExternalWeightBinding};
pub use image::{DeviceBuffer, DeviceImage, DmaEngine, RegisterSpace, TransferHandle};
pub use loopback::LoopbackImage;
pub use runtime_weights::{load_runtime_weights, write_verified};
pub use shapes::{IoShapeDescriptor, Shape};
pub use tensor::Tensor;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Accelerator, Datatype, DeviceImage, DriverConfig, DriverError, IoShapeDescriptor,
        LoopbackImage, Platform, Result, Shape, Tensor,
    };
}
