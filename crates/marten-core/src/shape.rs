use std::fmt;

use crate::dtype::DType;

// TensorDim — N-dimensional shape with an explicit batch axis
//
// Dimension 0 is always the batch axis. The batch is the only axis the
// engine is allowed to rewrite after shape inference (set_batch_size),
// so it is exposed separately from the feature dimensions.
//
//   - Vector:  TensorDim([B, 5])
//   - Matrix:  TensorDim([B, 3, 4])
//
// A rank-0 TensorDim is not batched and holds a single element; it is
// used for scalar outputs such as a reduced loss value.

/// Shape descriptor of a managed tensor. Axis 0 is the batch axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDim(Vec<usize>);

impl TensorDim {
    /// Create a new shape from dimension sizes. Axis 0 is the batch.
    pub fn new(dims: Vec<usize>) -> Self {
        TensorDim(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Size of the batch axis. A rank-0 shape has batch 1.
    pub fn batch(&self) -> usize {
        self.0.first().copied().unwrap_or(1)
    }

    /// Rewrite the batch axis. No-op for rank-0 shapes.
    pub fn set_batch(&mut self, batch: usize) {
        if let Some(b) = self.0.first_mut() {
            *b = batch;
        }
    }

    /// Number of elements per batch entry (product of non-batch axes).
    pub fn feature_len(&self) -> usize {
        self.0.iter().skip(1).product::<usize>().max(1)
    }

    /// Total number of elements (product of all dimensions).
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }

    /// Byte footprint of this shape at a given element format.
    pub fn byte_size(&self, dtype: DType) -> usize {
        self.elem_count() * dtype.size_in_bytes()
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0
            .get(d)
            .copied()
            .ok_or_else(|| crate::Error::msg(format!("dimension {} out of range for {}", d, self)))
    }
}

impl fmt::Display for TensorDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: TensorDim::from((3, 4)) instead of TensorDim::new(vec![3, 4])

impl From<usize> for TensorDim {
    /// 1-D shape (a bare batch axis).
    fn from(d: usize) -> Self {
        TensorDim(vec![d])
    }
}

impl From<(usize, usize)> for TensorDim {
    fn from((d0, d1): (usize, usize)) -> Self {
        TensorDim(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for TensorDim {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        TensorDim(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for TensorDim {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        TensorDim(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for TensorDim {
    fn from(v: Vec<usize>) -> Self {
        TensorDim(v)
    }
}

impl From<&[usize]> for TensorDim {
    fn from(s: &[usize]) -> Self {
        TensorDim(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_axis() {
        let mut d = TensorDim::from((4, 3, 2));
        assert_eq!(d.batch(), 4);
        assert_eq!(d.feature_len(), 6);
        assert_eq!(d.elem_count(), 24);

        d.set_batch(8);
        assert_eq!(d.batch(), 8);
        assert_eq!(d.elem_count(), 48);
        // Feature dims untouched by a batch rewrite.
        assert_eq!(d.feature_len(), 6);
    }

    #[test]
    fn test_scalar_dim() {
        let d = TensorDim::new(vec![]);
        assert_eq!(d.rank(), 0);
        assert_eq!(d.batch(), 1);
        assert_eq!(d.elem_count(), 1);
    }

    #[test]
    fn test_byte_size() {
        let d = TensorDim::from((2, 3));
        assert_eq!(d.byte_size(DType::F32), 24);
        assert_eq!(d.byte_size(DType::F16), 12);
    }

    #[test]
    fn test_display() {
        let d = TensorDim::from((3, 4));
        assert_eq!(format!("{}", d), "[3, 4]");
    }
}
