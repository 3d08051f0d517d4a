use half::f16;

use crate::dtype::DType;
use crate::error::{Result, TensorError};

/// CPU-side tensor storage.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    /// 32-bit floating point storage.
    F32(Vec<f32>),
    /// 16-bit floating point storage.
    F16(Vec<f16>),
}

impl CpuStorage {
    /// Number of elements in this storage.
    pub fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F16(v) => v.len(),
        }
    }

    /// Returns true if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the data as an f32 slice.
    ///
    /// # Errors
    /// Returns an error if the storage is not F32.
    pub fn as_f32_slice(&self) -> Result<&[f32]> {
        match self {
            CpuStorage::F32(v) => Ok(v.as_slice()),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::F32.to_string(),
                got: other.dtype().to_string(),
            }),
        }
    }

    /// Returns the data as a mutable f32 slice.
    ///
    /// # Errors
    /// Returns an error if the storage is not F32.
    pub fn as_f32_slice_mut(&mut self) -> Result<&mut [f32]> {
        match self {
            CpuStorage::F32(v) => Ok(v.as_mut_slice()),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::F32.to_string(),
                got: other.dtype().to_string(),
            }),
        }
    }

    /// Create zero-filled storage for the given dtype and element count.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        CpuStorage::full(dtype, n, 0.0)
    }

    /// Create storage with every element set to `value`.
    pub fn full(dtype: DType, n: usize, value: f32) -> Self {
        match dtype {
            DType::F32 => CpuStorage::F32(vec![value; n]),
            DType::F16 => CpuStorage::F16(vec![f16::from_f32(value); n]),
        }
    }

    /// Create storage from an f32 vector.
    pub fn from_f32_vec(data: Vec<f32>) -> Self {
        CpuStorage::F32(data)
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F16(_) => DType::F16,
        }
    }

    /// Read a single element as f32.
    pub fn get_f32(&self, i: usize) -> f32 {
        match self {
            CpuStorage::F32(v) => v[i],
            CpuStorage::F16(v) => v[i].to_f32(),
        }
    }

    /// Copy all elements out as f32, widening if needed.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            CpuStorage::F32(v) => v.clone(),
            CpuStorage::F16(v) => v.iter().map(|h| h.to_f32()).collect(),
        }
    }

    /// Convert to another dtype. Returns a clone if the dtype already matches.
    pub fn to_dtype(&self, dtype: DType) -> CpuStorage {
        match (self, dtype) {
            (CpuStorage::F32(_), DType::F32) | (CpuStorage::F16(_), DType::F16) => self.clone(),
            (CpuStorage::F32(v), DType::F16) => {
                CpuStorage::F16(v.iter().map(|&x| f16::from_f32(x)).collect())
            }
            (CpuStorage::F16(v), DType::F32) => {
                CpuStorage::F32(v.iter().map(|h| h.to_f32()).collect())
            }
        }
    }

    /// Gather `len` elements starting at each offset in `starts` into a new
    /// storage of the same dtype.
    pub(crate) fn gather_runs(&self, starts: &[usize], len: usize) -> CpuStorage {
        fn gather<T: Copy>(data: &[T], starts: &[usize], len: usize) -> Vec<T> {
            let mut out = Vec::with_capacity(starts.len() * len);
            for &s in starts {
                out.extend_from_slice(&data[s..s + len]);
            }
            out
        }
        match self {
            CpuStorage::F32(v) => CpuStorage::F32(gather(v, starts, len)),
            CpuStorage::F16(v) => CpuStorage::F16(gather(v, starts, len)),
        }
    }

    /// Scatter consecutive runs of `len` elements from `src` to the offsets
    /// in `starts`. `src` must already have this storage's dtype.
    pub(crate) fn scatter_runs(
        &mut self,
        starts: &[usize],
        len: usize,
        src: &CpuStorage,
    ) -> Result<()> {
        fn scatter<T: Copy>(dst: &mut [T], starts: &[usize], len: usize, src: &[T]) {
            for (run, &s) in starts.iter().enumerate() {
                dst[s..s + len].copy_from_slice(&src[run * len..(run + 1) * len]);
            }
        }
        match (self, src) {
            (CpuStorage::F32(d), CpuStorage::F32(s)) => scatter(d, starts, len, s),
            (CpuStorage::F16(d), CpuStorage::F16(s)) => scatter(d, starts, len, s),
            (d, s) => {
                return Err(TensorError::DTypeMismatch {
                    expected: d.dtype().to_string(),
                    got: s.dtype().to_string(),
                })
            }
        }
        Ok(())
    }

    /// Build a new storage by picking elements at `indices`.
    pub(crate) fn permuted(&self, indices: &[usize]) -> CpuStorage {
        match self {
            CpuStorage::F32(v) => CpuStorage::F32(indices.iter().map(|&i| v[i]).collect()),
            CpuStorage::F16(v) => CpuStorage::F16(indices.iter().map(|&i| v[i]).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32_vec() {
        let s = CpuStorage::from_f32_vec(vec![1.0, 2.0, 3.0]);
        assert_eq!(s.len(), 3);
        assert!(!s.is_empty());
        assert_eq!(s.as_f32_slice().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zeros_f16() {
        let s = CpuStorage::zeros(DType::F16, 5);
        assert_eq!(s.len(), 5);
        assert_eq!(s.dtype(), DType::F16);
        assert!(s.as_f32_slice().is_err());
        assert_eq!(s.to_f32_vec(), vec![0.0; 5]);
    }

    #[test]
    fn test_to_dtype_preserves_infinity() {
        let s = CpuStorage::full(DType::F32, 2, f32::NEG_INFINITY);
        let h = s.to_dtype(DType::F16);
        assert_eq!(h.get_f32(1), f32::NEG_INFINITY);
    }

    #[test]
    fn test_gather_scatter() {
        let s = CpuStorage::from_f32_vec((0..8).map(|x| x as f32).collect());
        let g = s.gather_runs(&[1, 5], 2);
        assert_eq!(g.to_f32_vec(), vec![1.0, 2.0, 5.0, 6.0]);

        let mut d = CpuStorage::zeros(DType::F32, 8);
        d.scatter_runs(&[0, 4], 2, &g).unwrap();
        assert_eq!(d.to_f32_vec(), vec![1.0, 2.0, 0.0, 0.0, 5.0, 6.0, 0.0, 0.0]);
    }

    #[test]
    fn test_scatter_dtype_mismatch() {
        let mut d = CpuStorage::zeros(DType::F16, 4);
        let s = CpuStorage::from_f32_vec(vec![1.0, 2.0]);
        assert!(d.scatter_runs(&[0], 2, &s).is_err());
    }

    #[test]
    fn test_mut_slice() {
        let mut s = CpuStorage::from_f32_vec(vec![1.0, 2.0]);
        let slice = s.as_f32_slice_mut().unwrap();
        slice[0] = 42.0;
        assert_eq!(s.as_f32_slice().unwrap()[0], 42.0);
    }
}
