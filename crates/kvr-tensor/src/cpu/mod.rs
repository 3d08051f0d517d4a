pub mod attention;

use crate::backend::ComputeBackend;
use crate::error::{Result, TensorError};

/// Pure-Rust CPU compute backend.
///
/// Implements all operations with straightforward loops optimized for
/// correctness rather than peak performance.
#[derive(Debug, Clone)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Max-subtracted softmax of one row. A row that is entirely -inf
/// becomes zeros.
pub(crate) fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        row.fill(0.0);
        return;
    }
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn matmul(&self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
        if a.len() != m * k {
            return Err(TensorError::Other(format!(
                "matmul: a.len()={} but expected m*k={}",
                a.len(),
                m * k
            )));
        }
        if b.len() != k * n {
            return Err(TensorError::Other(format!(
                "matmul: b.len()={} but expected k*n={}",
                b.len(),
                k * n
            )));
        }

        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for p in 0..k {
                    sum += a[i * k + p] * b[p * n + j];
                }
                c[i * n + j] = sum;
            }
        }
        Ok(c)
    }

    fn linear(
        &self,
        x: &[f32],
        w: &[f32],
        rows: usize,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Vec<f32>> {
        if x.len() != rows * in_dim {
            return Err(TensorError::Other(format!(
                "linear: x.len()={} but expected rows*in_dim={}",
                x.len(),
                rows * in_dim
            )));
        }
        if w.len() != out_dim * in_dim {
            return Err(TensorError::Other(format!(
                "linear: w.len()={} but expected out_dim*in_dim={}",
                w.len(),
                out_dim * in_dim
            )));
        }

        let mut y = vec![0.0f32; rows * out_dim];
        for r in 0..rows {
            let x_row = &x[r * in_dim..(r + 1) * in_dim];
            for o in 0..out_dim {
                let w_row = &w[o * in_dim..(o + 1) * in_dim];
                y[r * out_dim + o] = x_row.iter().zip(w_row).map(|(a, b)| a * b).sum();
            }
        }
        Ok(y)
    }

    fn add(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
        if a.len() != b.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![a.len()],
                got: vec![b.len()],
            });
        }
        Ok(a.iter().zip(b.iter()).map(|(x, y)| x + y).collect())
    }

    fn mul(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
        if a.len() != b.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![a.len()],
                got: vec![b.len()],
            });
        }
        Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).collect())
    }

    fn rms_norm(
        &self,
        x: &[f32],
        weight: &[f32],
        eps: f32,
        hidden_size: usize,
    ) -> Result<Vec<f32>> {
        if weight.len() != hidden_size {
            return Err(TensorError::Other(format!(
                "rms_norm: weight.len()={} but hidden_size={}",
                weight.len(),
                hidden_size
            )));
        }
        if hidden_size == 0 || x.len() % hidden_size != 0 {
            return Err(TensorError::Other(format!(
                "rms_norm: x.len()={} is not a multiple of hidden_size={}",
                x.len(),
                hidden_size
            )));
        }

        let mut result = vec![0.0f32; x.len()];
        for (row, out) in x.chunks(hidden_size).zip(result.chunks_mut(hidden_size)) {
            let mean_sq: f32 = row.iter().map(|v| v * v).sum::<f32>() / hidden_size as f32;
            let inv_rms = 1.0 / (mean_sq + eps).sqrt();
            for ((o, &v), &w) in out.iter_mut().zip(row).zip(weight) {
                *o = v * inv_rms * w;
            }
        }

        Ok(result)
    }

    fn softmax(&self, x: &[f32], n: usize) -> Result<Vec<f32>> {
        if n == 0 {
            return Err(TensorError::Other("softmax: n must be > 0".to_string()));
        }
        if x.len() % n != 0 {
            return Err(TensorError::Other(format!(
                "softmax: x.len()={} is not a multiple of n={}",
                x.len(),
                n
            )));
        }

        let mut result = x.to_vec();
        for row in result.chunks_mut(n) {
            softmax_in_place(row);
        }
        Ok(result)
    }

    fn silu(&self, x: &[f32]) -> Result<Vec<f32>> {
        Ok(x.iter().map(|&v| v / (1.0 + (-v).exp())).collect())
    }

    fn attention(
        &self,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        mask: &[f32],
        n_heads: usize,
        q_len: usize,
        kv_len: usize,
        head_dim: usize,
    ) -> Result<Vec<f32>> {
        attention::scaled_dot_product(q, k, v, mask, n_heads, q_len, kv_len, head_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> CpuBackend {
        CpuBackend::new()
    }

    #[test]
    fn test_matmul_basic() {
        let b = backend();
        // [1,2;3,4] @ [5,6;7,8] = [19,22;43,50]
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let x = vec![5.0, 6.0, 7.0, 8.0];
        let c = b.matmul(&a, &x, 2, 2, 2).unwrap();
        assert_eq!(c, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_linear_uses_out_in_layout() {
        let b = backend();
        // w is [out=3, in=2]
        let w = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let y = b.linear(&[2.0, 3.0, -1.0, 1.0], &w, 2, 2, 3).unwrap();
        assert_eq!(y, vec![2.0, 3.0, 5.0, -1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_linear_length_mismatch() {
        let b = backend();
        assert!(b.linear(&[1.0, 2.0], &[1.0; 5], 1, 2, 3).is_err());
    }

    #[test]
    fn test_add_mul() {
        let b = backend();
        assert_eq!(b.add(&[1.0, 2.0], &[3.0, 4.0]).unwrap(), vec![4.0, 6.0]);
        assert_eq!(b.mul(&[2.0, 3.0], &[4.0, 5.0]).unwrap(), vec![8.0, 15.0]);
        assert!(b.add(&[1.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_silu() {
        let b = backend();
        let r = b.silu(&[0.0, 1.0]).unwrap();
        assert!((r[0] - 0.0).abs() < 1e-6);
        // silu(1) = 1 / (1 + exp(-1)) ~= 0.7310586
        assert!((r[1] - 0.7310586).abs() < 1e-5);
    }

    #[test]
    fn test_softmax() {
        let b = backend();
        let r = b.softmax(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0], 3).unwrap();
        let sum: f32 = r[..3].iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(r[0] < r[1] && r[1] < r[2]);
        assert!((r[3] - 1.0 / 3.0).abs() < 1e-6);
        assert!(b.softmax(&[1.0, 2.0, 3.0], 2).is_err());
    }

    #[test]
    fn test_softmax_fully_masked_row_is_zero() {
        let b = backend();
        let r = b.softmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0, 0.0], 2).unwrap();
        assert_eq!(&r[..2], &[0.0, 0.0]);
        assert!((r[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rms_norm() {
        let b = backend();
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let w = vec![1.0, 1.0, 1.0, 2.0];
        let r = b.rms_norm(&x, &w, 1e-5, 4).unwrap();
        // rms = sqrt(mean([1,4,9,16]) + eps) = sqrt(7.5 + eps)
        let rms = (7.5f32 + 1e-5).sqrt();
        assert!((r[0] - 1.0 / rms).abs() < 1e-5);
        assert!((r[3] - 8.0 / rms).abs() < 1e-5);
    }

    #[test]
    fn test_rms_norm_rejects_ragged_rows() {
        let b = backend();
        assert!(b.rms_norm(&[1.0, 2.0, 3.0], &[1.0, 1.0], 1e-5, 2).is_err());
    }
}
