//! Dense and mixture-of-experts feed-forward layers.
//!
//! Both variants are picked once from the config and used through the
//! [`FeedForward`] interface by the transformer block.

use std::cmp::Ordering;
use std::fmt::Debug;

use kvr_tensor::{ComputeBackend, Tensor};

use super::config::ModelConfig;
use super::layers::{join, Linear, Parameters};
use crate::error::{ModelError, Result};

/// A position-wise feed-forward transform of `[rows, dim]` activations.
pub trait FeedForward: Parameters + Debug + Send + Sync {
    /// Checkpoint module name the parameters live under inside a block.
    fn module_name(&self) -> &'static str;

    fn apply(&self, x: &[f32], rows: usize, backend: &dyn ComputeBackend) -> Result<Vec<f32>>;
}

/// Build the variant the config asks for.
pub fn build(config: &ModelConfig) -> Box<dyn FeedForward> {
    if config.moe {
        Box::new(MoeFeedForward::new(config))
    } else {
        Box::new(DenseFeedForward::new(config))
    }
}

/// Gated unit `w2(silu(w1(x)) * w3(x))`.
#[derive(Debug, Clone)]
pub struct DenseFeedForward {
    pub w1: Linear,
    pub w2: Linear,
    pub w3: Linear,
}

impl DenseFeedForward {
    pub fn new(config: &ModelConfig) -> DenseFeedForward {
        DenseFeedForward {
            w1: Linear::new(config.dim, config.hidden_dim),
            w2: Linear::new(config.hidden_dim, config.dim),
            w3: Linear::new(config.dim, config.hidden_dim),
        }
    }
}

impl FeedForward for DenseFeedForward {
    fn module_name(&self) -> &'static str {
        "feed_forward"
    }

    fn apply(&self, x: &[f32], rows: usize, backend: &dyn ComputeBackend) -> Result<Vec<f32>> {
        let gate = backend.silu(&self.w1.forward(x, rows, backend)?)?;
        let up = self.w3.forward(x, rows, backend)?;
        let hidden = backend.mul(&gate, &up)?;
        self.w2.forward(&hidden, rows, backend)
    }
}

impl Parameters for DenseFeedForward {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.w1.named_parameters(&join(prefix, "w1"), out);
        self.w2.named_parameters(&join(prefix, "w2"), out);
        self.w3.named_parameters(&join(prefix, "w3"), out);
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    ) {
        self.w1.named_parameters_mut(&join(prefix, "w1"), out);
        self.w2.named_parameters_mut(&join(prefix, "w2"), out);
        self.w3.named_parameters_mut(&join(prefix, "w3"), out);
    }
}

/// Experts each token is routed to.
pub const ROUTED_EXPERTS: usize = 2;

/// Indices and combination weights of the `k` highest router scores.
///
/// Weights are the softmax over exactly the selected scores. Equal scores
/// are ranked by the lower expert index.
pub fn top_experts(
    scores: &[f32],
    k: usize,
    backend: &dyn ComputeBackend,
) -> Result<Vec<(usize, f32)>> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    order.truncate(k);
    if order.is_empty() {
        return Ok(Vec::new());
    }

    let selected: Vec<f32> = order.iter().map(|&e| scores[e]).collect();
    let weights = backend.softmax(&selected, selected.len())?;
    Ok(order.into_iter().zip(weights).collect())
}

/// Sparse mixture of gated experts with a linear router. Each token goes to
/// its [`ROUTED_EXPERTS`] best-scoring experts.
///
/// Expert weights are stacked per expert: `w1`, `w2` and `w3` are all
/// `[num_experts, hidden_dim, dim]`.
#[derive(Debug, Clone)]
pub struct MoeFeedForward {
    pub gate: Linear,
    pub w1: Tensor,
    pub w2: Tensor,
    pub w3: Tensor,
    dim: usize,
    hidden_dim: usize,
}

impl MoeFeedForward {
    pub fn new(config: &ModelConfig) -> MoeFeedForward {
        let expert_shape = [config.num_experts, config.hidden_dim, config.dim];
        MoeFeedForward {
            gate: Linear::new(config.dim, config.num_experts),
            w1: Tensor::zeros(expert_shape),
            w2: Tensor::zeros(expert_shape),
            w3: Tensor::zeros(expert_shape),
            dim: config.dim,
            hidden_dim: config.hidden_dim,
        }
    }

    pub fn num_experts(&self) -> usize {
        self.gate.out_dim()
    }

    /// One expert's gated unit applied to a single token.
    pub fn expert_forward(
        &self,
        expert: usize,
        x: &[f32],
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<f32>> {
        if expert >= self.num_experts() {
            return Err(ModelError::Other(format!(
                "expert {} out of range for {} experts",
                expert,
                self.num_experts()
            )));
        }
        let block = self.hidden_dim * self.dim;
        let range = expert * block..(expert + 1) * block;
        let w1 = &self.w1.as_f32_slice()?[range.clone()];
        let w2 = &self.w2.as_f32_slice()?[range.clone()];
        let w3 = &self.w3.as_f32_slice()?[range];

        let x1 = backend.silu(&backend.linear(x, w1, 1, self.dim, self.hidden_dim)?)?;
        let x3 = backend.linear(x, w3, 1, self.dim, self.hidden_dim)?;
        let hidden = backend.mul(&x1, &x3)?;
        Ok(backend.matmul(&hidden, w2, 1, self.hidden_dim, self.dim)?)
    }
}

impl FeedForward for MoeFeedForward {
    fn module_name(&self) -> &'static str {
        "block_sparse_moe"
    }

    fn apply(&self, x: &[f32], rows: usize, backend: &dyn ComputeBackend) -> Result<Vec<f32>> {
        let scores = self.gate.forward(x, rows, backend)?;
        let n_experts = self.num_experts();
        let mut out = vec![0.0f32; rows * self.dim];
        for ((token, token_scores), token_out) in x
            .chunks(self.dim)
            .zip(scores.chunks(n_experts))
            .zip(out.chunks_mut(self.dim))
        {
            for (expert, weight) in top_experts(token_scores, ROUTED_EXPERTS, backend)? {
                let y = self.expert_forward(expert, token, backend)?;
                for (o, v) in token_out.iter_mut().zip(y) {
                    *o += weight * v;
                }
            }
        }
        Ok(out)
    }
}

impl Parameters for MoeFeedForward {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.gate.named_parameters(&join(prefix, "gate"), out);
        let cond = join(prefix, "cond_ffn");
        out.push((join(&cond, "w1"), &self.w1));
        out.push((join(&cond, "w2"), &self.w2));
        out.push((join(&cond, "w3"), &self.w3));
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    ) {
        self.gate.named_parameters_mut(&join(prefix, "gate"), out);
        let cond = join(prefix, "cond_ffn");
        out.push((join(&cond, "w1"), &mut self.w1));
        out.push((join(&cond, "w2"), &mut self.w2));
        out.push((join(&cond, "w3"), &mut self.w3));
    }
}
