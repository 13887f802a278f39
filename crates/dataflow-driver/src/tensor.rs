//! Dense integer tensors in batch-major layout
//!
//! The driver moves quantized data, so elements are `i64` raw codes (wide
//! enough for every supported [`crate::Datatype`]). Reshaping is a metadata
//! change on the owned flat buffer — fold/unfold never copy element data.

use crate::error::{DriverError, Result};
use crate::shapes::Shape;

/// Dense tensor with a flat row-major element buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    data: Vec<i64>,
    shape: Shape,
}

impl Tensor {
    /// Create a tensor from flat data and a shape
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if `data.len()` does not equal
    /// the shape's element count.
    pub fn new(data: Vec<i64>, shape: Shape) -> Result<Self> {
        if data.len() != shape.total_elements() {
            return Err(DriverError::precondition(format!(
                "tensor data has {} elements but shape {} holds {}",
                data.len(),
                shape,
                shape.total_elements()
            )));
        }
        Ok(Self { data, shape })
    }

    /// All-zeros tensor of the given shape
    #[must_use]
    pub fn zeros(shape: Shape) -> Self {
        Self {
            data: vec![0; shape.total_elements()],
            shape,
        }
    }

    /// Tensor filled by an index function over the flat element order
    #[must_use]
    pub fn from_fn(shape: Shape, f: impl Fn(usize) -> i64) -> Self {
        Self {
            data: (0..shape.total_elements()).map(f).collect(),
            shape,
        }
    }

    /// Tensor shape
    pub const fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Flat element buffer, row-major
    pub fn data(&self) -> &[i64] {
        &self.data
    }

    /// Consume into the flat element buffer
    #[must_use]
    pub fn into_data(self) -> Vec<i64> {
        self.data
    }

    /// Reshape without moving data (the buffer is reused as-is)
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Precondition`] if the new shape has a
    /// different element count.
    pub fn reshape(self, shape: Shape) -> Result<Self> {
        if shape.total_elements() != self.data.len() {
            return Err(DriverError::precondition(format!(
                "cannot reshape {} elements into shape {}",
                self.data.len(),
                shape
            )));
        }
        Ok(Self {
            data: self.data,
            shape,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_element_count() {
        assert!(Tensor::new(vec![1, 2, 3], [2, 2].into()).is_err());
        assert!(Tensor::new(vec![1, 2, 3, 4], [2, 2].into()).is_ok());
    }

    #[test]
    fn test_reshape_preserves_data() {
        let t = Tensor::new(vec![1, 2, 3, 4, 5, 6], [1, 6].into()).unwrap();
        let r = t.reshape([1, 2, 3].into()).unwrap();
        assert_eq!(r.data(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(r.shape().dims, vec![1, 2, 3]);
    }

    #[test]
    fn test_reshape_rejects_wrong_count() {
        let t = Tensor::zeros([2, 3].into());
        assert!(t.reshape([2, 4].into()).is_err());
    }

    #[test]
    fn test_from_fn() {
        let t = Tensor::from_fn([2, 2].into(), |i| i as i64 * 10);
        assert_eq!(t.data(), &[0, 10, 20, 30]);
    }
}
