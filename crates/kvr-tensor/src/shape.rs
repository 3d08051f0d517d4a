use crate::error::{Result, TensorError};
use std::fmt;

/// A tensor shape, wrapping a vector of dimension sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Create a new shape from a vector of dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    /// Create a shape from a slice of dimensions.
    pub fn from_slice(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (product of all dimension sizes).
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the size of dimension `i`.
    ///
    /// # Panics
    /// Panics if `i >= ndim()`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Returns a reference to the underlying dimension sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Computes row-major contiguous strides for this shape.
    ///
    /// For a shape [d0, d1, d2], the strides are [d1*d2, d2, 1].
    pub fn strides(&self) -> Vec<usize> {
        if self.dims.is_empty() {
            return vec![];
        }
        let mut strides = vec![0usize; self.dims.len()];
        strides[self.dims.len() - 1] = 1;
        for i in (0..self.dims.len() - 1).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Fails unless `axis` names one of this shape's dimensions.
    pub fn check_axis(&self, axis: usize) -> Result<()> {
        if axis >= self.ndim() {
            return Err(TensorError::InvalidAxis {
                axis,
                ndim: self.ndim(),
            });
        }
        Ok(())
    }

    /// Splits the shape around `axis` into `(outer, dim, inner)` where
    /// `outer` is the product of leading dims and `inner` of trailing dims.
    ///
    /// Row-major data then addresses element `(o, d, i)` at
    /// `(o * dim + d) * inner + i`.
    pub fn split_at_axis(&self, axis: usize) -> Result<(usize, usize, usize)> {
        self.check_axis(axis)?;
        let outer = self.dims[..axis].iter().product();
        let inner = self.dims[axis + 1..].iter().product();
        Ok((outer, self.dims[axis], inner))
    }

    /// Returns a copy of this shape with dimension `axis` replaced by `size`.
    pub fn with_dim(&self, axis: usize, size: usize) -> Result<Shape> {
        self.check_axis(axis)?;
        let mut dims = self.dims.clone();
        dims[axis] = size;
        Ok(Shape::new(dims))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_shape() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.dim(2), 4);
        assert_eq!(s.to_string(), "[2, 3, 4]");
    }

    #[test]
    fn test_strides() {
        let s = Shape::from([2, 3, 4]);
        assert_eq!(s.strides(), vec![12, 4, 1]);
    }

    #[test]
    fn test_scalar_shape() {
        let s = Shape::new(vec![]);
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.numel(), 1); // product of empty = 1
        assert_eq!(s.strides(), vec![]);
    }

    #[test]
    fn test_split_at_axis() {
        let s = Shape::from([1, 2, 12, 8]);
        assert_eq!(s.split_at_axis(0).unwrap(), (1, 1, 192));
        assert_eq!(s.split_at_axis(2).unwrap(), (2, 12, 8));
        assert_eq!(s.split_at_axis(3).unwrap(), (24, 8, 1));
        assert!(s.split_at_axis(4).is_err());
    }

    #[test]
    fn test_with_dim() {
        let s = Shape::from([1, 2, 12, 8]);
        assert_eq!(s.with_dim(2, 4).unwrap().dims(), &[1, 2, 4, 8]);
        assert!(s.with_dim(7, 1).is_err());
    }
}
