//! Tensor shapes and per-accelerator I/O shape metadata
//!
//! Every accelerator build ships an [`IoShapeDescriptor`]: for each input and
//! output stream the element datatype and three shape views of the same data
//! — *normal* (application-facing, batch-major), *folded* (hardware-tiled
//! reshape, same element count) and *packed* (byte-level layout after bit
//! packing). The descriptor is immutable; the leading (batch) dimension of
//! every shape is substituted with the driver's current batch size on access.

use crate::datatype::Datatype;
use crate::error::{DriverError, Result};

/// Tensor shape (dimensions)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    /// Dimensions, batch-major (e.g. [batch, folds, lanes])
    pub dims: Vec<usize>,
}

impl Shape {
    /// Create new shape
    pub const fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Get total number of elements
    #[must_use]
    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Get number of dimensions
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Innermost (lane/SIMD) dimension; 1 for scalar shapes
    #[must_use]
    pub fn inner(&self) -> usize {
        self.dims.last().copied().unwrap_or(1)
    }

    /// Same shape with the leading dimension replaced by `batch`
    #[must_use]
    pub fn with_batch(&self, batch: usize) -> Self {
        let mut dims = self.dims.clone();
        if let Some(first) = dims.first_mut() {
            *first = batch;
        }
        Self { dims }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, ")")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

/// Immutable per-accelerator-build I/O metadata
///
/// Generated once by the accelerator build flow and supplied to
/// [`crate::Accelerator::new`]. Shape vectors are indexed by input/output
/// stream index; the stored leading dimension is a placeholder replaced by
/// the runtime batch size.
#[derive(Debug, Clone)]
pub struct IoShapeDescriptor {
    /// Per-input element datatype
    pub idt: Vec<Datatype>,
    /// Per-output element datatype
    pub odt: Vec<Datatype>,
    /// Per-input normal (application-facing) shape
    pub ishape_normal: Vec<Shape>,
    /// Per-input folded (hardware-tiled) shape
    pub ishape_folded: Vec<Shape>,
    /// Per-input packed (byte-level) shape
    pub ishape_packed: Vec<Shape>,
    /// Per-output normal shape
    pub oshape_normal: Vec<Shape>,
    /// Per-output folded shape
    pub oshape_folded: Vec<Shape>,
    /// Per-output packed shape
    pub oshape_packed: Vec<Shape>,
    /// Input DMA engine names; defaults to the single conventional `idma0`
    pub input_dma_names: Vec<String>,
    /// Output DMA engine names; defaults to the single conventional `odma0`
    pub output_dma_names: Vec<String>,
    /// Expected external-weight count, checked after weight discovery
    pub num_external_weights: Option<usize>,
}

impl IoShapeDescriptor {
    /// Convenience constructor for a single-input single-output accelerator
    /// with the conventional engine names.
    pub fn single_io(
        idt: Datatype,
        odt: Datatype,
        ishape: (Shape, Shape, Shape),
        oshape: (Shape, Shape, Shape),
    ) -> Self {
        Self {
            idt: vec![idt],
            odt: vec![odt],
            ishape_normal: vec![ishape.0],
            ishape_folded: vec![ishape.1],
            ishape_packed: vec![ishape.2],
            oshape_normal: vec![oshape.0],
            oshape_folded: vec![oshape.1],
            oshape_packed: vec![oshape.2],
            input_dma_names: vec!["idma0".to_string()],
            output_dma_names: vec!["odma0".to_string()],
            num_external_weights: None,
        }
    }

    /// Number of accelerator inputs
    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.ishape_normal.len()
    }

    /// Number of accelerator outputs
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.oshape_normal.len()
    }

    /// Check internal consistency: all per-input vectors must have the same
    /// length, likewise per-output, and folded shapes must preserve the
    /// element count of their normal counterparts.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] on any inconsistency.
    pub fn validate(&self) -> Result<()> {
        let ni = self.num_inputs();
        let no = self.num_outputs();
        if ni == 0 || no == 0 {
            return Err(DriverError::configuration(
                "descriptor must declare at least one input and one output",
            ));
        }
        if [
            self.idt.len(),
            self.ishape_folded.len(),
            self.ishape_packed.len(),
            self.input_dma_names.len(),
        ] != [ni; 4]
        {
            return Err(DriverError::configuration(format!(
                "inconsistent input metadata lengths (expected {ni} entries per key)"
            )));
        }
        if [
            self.odt.len(),
            self.oshape_folded.len(),
            self.oshape_packed.len(),
            self.output_dma_names.len(),
        ] != [no; 4]
        {
            return Err(DriverError::configuration(format!(
                "inconsistent output metadata lengths (expected {no} entries per key)"
            )));
        }
        for i in 0..ni {
            if self.ishape_normal[i].total_elements() != self.ishape_folded[i].total_elements() {
                return Err(DriverError::configuration(format!(
                    "input {i}: folded shape {} does not preserve element count of normal {}",
                    self.ishape_folded[i], self.ishape_normal[i]
                )));
            }
        }
        for o in 0..no {
            if self.oshape_normal[o].total_elements() != self.oshape_folded[o].total_elements() {
                return Err(DriverError::configuration(format!(
                    "output {o}: folded shape {} does not preserve element count of normal {}",
                    self.oshape_folded[o], self.oshape_normal[o]
                )));
            }
        }
        Ok(())
    }

    fn indexed<'a>(v: &'a [Shape], ind: usize, what: &str) -> Result<&'a Shape> {
        v.get(ind).ok_or_else(|| {
            DriverError::precondition(format!("{what} index {ind} out of range (have {})", v.len()))
        })
    }

    /// Normal shape of input `ind` at the given batch size
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn ishape_normal(&self, ind: usize, batch: usize) -> Result<Shape> {
        Ok(Self::indexed(&self.ishape_normal, ind, "input")?.with_batch(batch))
    }

    /// Folded shape of input `ind` at the given batch size
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn ishape_folded(&self, ind: usize, batch: usize) -> Result<Shape> {
        Ok(Self::indexed(&self.ishape_folded, ind, "input")?.with_batch(batch))
    }

    /// Packed shape of input `ind` at the given batch size
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn ishape_packed(&self, ind: usize, batch: usize) -> Result<Shape> {
        Ok(Self::indexed(&self.ishape_packed, ind, "input")?.with_batch(batch))
    }

    /// Normal shape of output `ind` at the given batch size
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn oshape_normal(&self, ind: usize, batch: usize) -> Result<Shape> {
        Ok(Self::indexed(&self.oshape_normal, ind, "output")?.with_batch(batch))
    }

    /// Folded shape of output `ind` at the given batch size
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn oshape_folded(&self, ind: usize, batch: usize) -> Result<Shape> {
        Ok(Self::indexed(&self.oshape_folded, ind, "output")?.with_batch(batch))
    }

    /// Packed shape of output `ind` at the given batch size
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn oshape_packed(&self, ind: usize, batch: usize) -> Result<Shape> {
        Ok(Self::indexed(&self.oshape_packed, ind, "output")?.with_batch(batch))
    }

    /// Datatype of input `ind`
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn idt(&self, ind: usize) -> Result<Datatype> {
        self.idt.get(ind).copied().ok_or_else(|| {
            DriverError::precondition(format!(
                "input index {ind} out of range (have {})",
                self.idt.len()
            ))
        })
    }

    /// Datatype of output `ind`
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `ind` is out of range.
    pub fn odt(&self, ind: usize) -> Result<Datatype> {
        self.odt.get(ind).copied().ok_or_else(|| {
            DriverError::precondition(format!(
                "output index {ind} out of range (have {})",
                self.odt.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> IoShapeDescriptor {
        IoShapeDescriptor::single_io(
            Datatype::UInt(8),
            Datatype::UInt(8),
            ([1, 8].into(), [1, 2, 4].into(), [1, 2, 4].into()),
            ([1, 8].into(), [1, 2, 4].into(), [1, 2, 4].into()),
        )
    }

    #[test]
    fn test_with_batch_replaces_leading_dim() {
        let s = Shape::from([1, 2, 4]);
        assert_eq!(s.with_batch(16).dims, vec![16, 2, 4]);
        // the descriptor's placeholder is untouched
        assert_eq!(s.dims, vec![1, 2, 4]);
    }

    #[test]
    fn test_shape_accessors_substitute_batch() {
        let d = descriptor();
        assert_eq!(d.ishape_normal(0, 4).unwrap().dims, vec![4, 8]);
        assert_eq!(d.oshape_packed(0, 2).unwrap().dims, vec![2, 2, 4]);
    }

    #[test]
    fn test_out_of_range_index() {
        let d = descriptor();
        assert!(d.ishape_normal(1, 1).is_err());
        assert!(d.odt(3).is_err());
    }

    #[test]
    fn test_validate_catches_element_count_drift() {
        let mut d = descriptor();
        d.ishape_folded[0] = [1, 3].into();
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_validate_ok() {
        assert!(descriptor().validate().is_ok());
    }
}
