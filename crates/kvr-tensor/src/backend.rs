use std::fmt::Debug;

use crate::error::Result;

/// Trait for pluggable compute backends.
///
/// All operations work on f32 slices. Data is passed in as slices and
/// returned as owned vectors; callers keep the shapes.
pub trait ComputeBackend: Send + Sync + Debug {
    /// Returns the name of this backend (e.g., "cpu").
    fn name(&self) -> &str;

    /// Matrix multiplication: C = A @ B.
    ///
    /// - `a`: row-major data of shape [m, k]
    /// - `b`: row-major data of shape [k, n]
    /// - Returns: row-major data of shape [m, n]
    fn matmul(&self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>>;

    /// Bias-free linear projection: Y = X @ W^T.
    ///
    /// - `x`: row-major data of shape [rows, in_dim]
    /// - `w`: row-major weights of shape [out_dim, in_dim]
    /// - Returns: row-major data of shape [rows, out_dim]
    fn linear(
        &self,
        x: &[f32],
        w: &[f32],
        rows: usize,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Vec<f32>>;

    /// Element-wise addition: result[i] = a[i] + b[i].
    fn add(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>>;

    /// Element-wise multiplication: result[i] = a[i] * b[i].
    fn mul(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>>;

    /// RMS normalization.
    ///
    /// For each row of `hidden_size` elements in `x`:
    ///   rms = sqrt(mean(x^2) + eps)
    ///   result[i] = x[i] * weight[i] / rms
    fn rms_norm(
        &self,
        x: &[f32],
        weight: &[f32],
        eps: f32,
        hidden_size: usize,
    ) -> Result<Vec<f32>>;

    /// Softmax over consecutive chunks of `n` elements. A chunk that is
    /// entirely -inf yields zeros.
    fn softmax(&self, x: &[f32], n: usize) -> Result<Vec<f32>>;

    /// SiLU activation: result[i] = x[i] / (1 + exp(-x[i])).
    fn silu(&self, x: &[f32]) -> Result<Vec<f32>>;

    /// Scaled dot-product attention with an additive mask.
    ///
    /// - `q`: [n_heads, q_len, head_dim]
    /// - `k`, `v`: [n_heads, kv_len, head_dim]
    /// - `mask`: [q_len, kv_len], added to the scaled scores of every head
    /// - Returns: [n_heads, q_len, head_dim]
    ///
    /// Scores are scaled by 1/sqrt(head_dim). A query row whose scores are
    /// all -inf yields zeros.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<Vec<f32>>;
}
