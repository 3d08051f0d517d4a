use kvr_tensor::{ComputeBackend, Tensor};

use crate::error::{ModelError, Result};

/// Components that own named, loadable weight tensors.
///
/// Names are dotted paths relative to `prefix`, matching the parameter names
/// checkpoints are saved under (e.g. `layers.0.attention.wq.weight`).
pub trait Parameters {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>);

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    );
}

/// Join a parameter prefix and a child name with a dot.
pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Bias-free linear projection with weights stored `[out_dim, in_dim]`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Tensor,
}

impl Linear {
    /// Zero-initialised projection, filled later from a checkpoint.
    pub fn new(in_dim: usize, out_dim: usize) -> Linear {
        Linear {
            weight: Tensor::zeros([out_dim, in_dim]),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_dim(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Project `rows` row vectors of length `in_dim`.
    pub fn forward(&self, x: &[f32], rows: usize, backend: &dyn ComputeBackend) -> Result<Vec<f32>> {
        Ok(backend.linear(
            x,
            self.weight.as_f32_slice()?,
            rows,
            self.in_dim(),
            self.out_dim(),
        )?)
    }
}

impl Parameters for Linear {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((join(prefix, "weight"), &self.weight));
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    ) {
        out.push((join(prefix, "weight"), &mut self.weight));
    }
}

/// Root-mean-square normalization over the last axis.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    pub weight: Tensor,
    pub eps: f32,
}

impl RmsNorm {
    /// Unit-weight norm over vectors of length `dim`.
    pub fn new(dim: usize, eps: f32) -> RmsNorm {
        RmsNorm {
            weight: Tensor::ones([dim]),
            eps,
        }
    }

    pub fn dim(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Normalize every consecutive run of `dim` elements of `x`.
    pub fn forward(&self, x: &[f32], backend: &dyn ComputeBackend) -> Result<Vec<f32>> {
        if x.len() % self.dim() != 0 {
            return Err(ModelError::ShapeMismatch {
                what: "rms_norm input".to_string(),
                expected: vec![self.dim()],
                got: vec![x.len()],
            });
        }
        Ok(backend.rms_norm(x, self.weight.as_f32_slice()?, self.eps, self.dim())?)
    }
}

impl Parameters for RmsNorm {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((join(prefix, "weight"), &self.weight));
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    ) {
        out.push((join(prefix, "weight"), &mut self.weight));
    }
}
