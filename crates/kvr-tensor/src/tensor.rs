use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::CpuStorage;

/// A tensor backed by CPU storage.
///
/// Holds contiguous, row-major data with an associated shape. The dtype is
/// whatever the storage holds. Structural operations (narrow, concat,
/// transpose, repeat, region assignment) work for every dtype; arithmetic
/// goes through a `ComputeBackend` on the f32 data.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: CpuStorage,
    shape: Shape,
}

impl Tensor {
    /// Create a new tensor from f32 data and a shape.
    ///
    /// # Panics
    /// Panics if `data.len() != shape.numel()`.
    pub fn new(data: Vec<f32>, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        assert_eq!(
            data.len(),
            shape.numel(),
            "data length {} does not match shape {:?} (numel={})",
            data.len(),
            shape,
            shape.numel()
        );
        Tensor {
            storage: CpuStorage::from_f32_vec(data),
            shape,
        }
    }

    /// Fallible counterpart of [`Tensor::new`].
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Tensor {
            storage: CpuStorage::from_f32_vec(data),
            shape,
        })
    }

    /// Create a zero-filled f32 tensor with the given shape.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Tensor::full(shape, 0.0, DType::F32)
    }

    /// Create a tensor filled with ones with the given shape.
    pub fn ones(shape: impl Into<Shape>) -> Self {
        Tensor::full(shape, 1.0, DType::F32)
    }

    /// Create a tensor of `dtype` with every element set to `value`.
    pub fn full(shape: impl Into<Shape>, value: f32, dtype: DType) -> Self {
        let shape = shape.into();
        Tensor {
            storage: CpuStorage::full(dtype, shape.numel(), value),
            shape,
        }
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Shorthand for `self.shape().dims()`.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Returns the underlying storage reference.
    pub fn storage(&self) -> &CpuStorage {
        &self.storage
    }

    /// Returns the underlying data as an f32 slice.
    ///
    /// # Errors
    /// Returns an error if the tensor is not stored as F32.
    pub fn as_f32_slice(&self) -> Result<&[f32]> {
        self.storage.as_f32_slice()
    }

    /// Copies the data out as f32 regardless of storage dtype.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.storage.to_f32_vec()
    }

    /// Read one element by multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        if index.len() != self.shape.ndim() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: index.to_vec(),
            });
        }
        let mut offset = 0;
        for (axis, (&i, stride)) in index.iter().zip(self.shape.strides()).enumerate() {
            let size = self.shape.dim(axis);
            if i >= size {
                return Err(TensorError::OutOfRange {
                    axis,
                    start: i,
                    end: i + 1,
                    size,
                });
            }
            offset += i * stride;
        }
        Ok(self.storage.get_f32(offset))
    }

    /// Convert to another dtype.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        Tensor {
            storage: self.storage.to_dtype(dtype),
            shape: self.shape.clone(),
        }
    }

    /// Reshape the tensor, returning a new tensor with the same data but
    /// a different shape.
    ///
    /// The total number of elements must remain the same.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Tensor> {
        let new_shape = new_shape.into();
        if self.shape.numel() != new_shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: new_shape.dims().to_vec(),
            });
        }
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: new_shape,
        })
    }

    /// Returns the contiguous range `[start, start + len)` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let (outer, dim, inner) = self.shape.split_at_axis(axis)?;
        if start + len > dim {
            return Err(TensorError::OutOfRange {
                axis,
                start,
                end: start + len,
                size: dim,
            });
        }
        let starts: Vec<usize> = (0..outer).map(|o| (o * dim + start) * inner).collect();
        Ok(Tensor {
            storage: self.storage.gather_runs(&starts, len * inner),
            shape: self.shape.with_dim(axis, len)?,
        })
    }

    /// Concatenate tensors along `axis`.
    ///
    /// All inputs must agree on every other dimension. The result takes the
    /// dtype of the first input.
    pub fn cat(tensors: &[&Tensor], axis: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| TensorError::Other("cat: no tensors given".to_string()))?;
        let (outer, _, inner) = first.shape.split_at_axis(axis)?;

        let mut total = 0;
        for t in tensors {
            let expected = first.shape.with_dim(axis, t.shape.dims().get(axis).copied().unwrap_or(0))?;
            if t.shape != expected {
                return Err(TensorError::ShapeMismatch {
                    expected: expected.dims().to_vec(),
                    got: t.shape.dims().to_vec(),
                });
            }
            total += t.shape.dim(axis);
        }

        let parts: Vec<Vec<f32>> = tensors.iter().map(|t| t.to_f32_vec()).collect();
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for (t, part) in tensors.iter().zip(&parts) {
                let run = t.shape.dim(axis) * inner;
                data.extend_from_slice(&part[o * run..(o + 1) * run]);
            }
        }

        Ok(Tensor {
            storage: CpuStorage::from_f32_vec(data).to_dtype(first.dtype()),
            shape: first.shape.with_dim(axis, total)?,
        })
    }

    /// Stack equally-shaped tensors along a new leading axis.
    pub fn stack(tensors: &[&Tensor]) -> Result<Tensor> {
        let expanded: Vec<Tensor> = tensors
            .iter()
            .map(|t| {
                let mut dims = vec![1];
                dims.extend_from_slice(t.dims());
                t.reshape(dims)
            })
            .collect::<Result<_>>()?;
        let refs: Vec<&Tensor> = expanded.iter().collect();
        Tensor::cat(&refs, 0)
    }

    /// Swap two axes, materializing the result contiguously.
    pub fn transpose(&self, a: usize, b: usize) -> Result<Tensor> {
        self.shape.check_axis(a)?;
        self.shape.check_axis(b)?;
        if a == b {
            return Ok(self.clone());
        }

        let mut out_dims = self.shape.dims().to_vec();
        out_dims.swap(a, b);
        let out_shape = Shape::new(out_dims);

        let in_strides = self.shape.strides();
        let mut src_strides = in_strides.clone();
        src_strides.swap(a, b);

        let ndim = out_shape.ndim();
        let mut index = vec![0usize; ndim];
        let mut indices = Vec::with_capacity(out_shape.numel());
        for _ in 0..out_shape.numel() {
            indices.push(index.iter().zip(&src_strides).map(|(i, s)| i * s).sum());
            for axis in (0..ndim).rev() {
                index[axis] += 1;
                if index[axis] < out_shape.dim(axis) {
                    break;
                }
                index[axis] = 0;
            }
        }

        Ok(Tensor {
            storage: self.storage.permuted(&indices),
            shape: out_shape,
        })
    }

    /// Repeat every slice along `axis` `repeats` times in place, so that
    /// element `i` of the axis lands at `i * repeats .. (i + 1) * repeats`.
    pub fn repeat_interleave(&self, repeats: usize, axis: usize) -> Result<Tensor> {
        let (outer, dim, inner) = self.shape.split_at_axis(axis)?;
        let mut starts = Vec::with_capacity(outer * dim * repeats);
        for o in 0..outer {
            for d in 0..dim {
                let start = (o * dim + d) * inner;
                starts.extend(std::iter::repeat(start).take(repeats));
            }
        }
        Ok(Tensor {
            storage: self.storage.gather_runs(&starts, inner),
            shape: self.shape.with_dim(axis, dim * repeats)?,
        })
    }

    /// Write `src` into this tensor at per-axis `offsets`, converting to this
    /// tensor's dtype. `src` must have the same rank and fit inside `self`.
    pub fn assign_region(&mut self, offsets: &[usize], src: &Tensor) -> Result<()> {
        let ndim = self.shape.ndim();
        if offsets.len() != ndim || src.shape.ndim() != ndim {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: src.shape.dims().to_vec(),
            });
        }
        for axis in 0..ndim {
            let end = offsets[axis] + src.shape.dim(axis);
            if end > self.shape.dim(axis) {
                return Err(TensorError::OutOfRange {
                    axis,
                    start: offsets[axis],
                    end,
                    size: self.shape.dim(axis),
                });
            }
        }
        if src.shape.numel() == 0 {
            return Ok(());
        }
        if ndim == 0 {
            let value = src.storage.to_dtype(self.dtype());
            return self.storage.scatter_runs(&[0], 1, &value);
        }

        let strides = self.shape.strides();
        let run = src.shape.dim(ndim - 1);
        let lead = &src.shape.dims()[..ndim - 1];
        let n_runs: usize = lead.iter().product();

        let mut index = vec![0usize; ndim - 1];
        let mut starts = Vec::with_capacity(n_runs);
        for _ in 0..n_runs {
            let mut start = offsets[ndim - 1];
            for axis in 0..ndim - 1 {
                start += (offsets[axis] + index[axis]) * strides[axis];
            }
            starts.push(start);
            for axis in (0..ndim - 1).rev() {
                index[axis] += 1;
                if index[axis] < lead[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }

        let converted = src.storage.to_dtype(self.dtype());
        self.storage.scatter_runs(&starts, run, &converted)
    }
}
