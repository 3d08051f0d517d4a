use kvr_tensor::{ComputeBackend, DType, Tensor};

use super::config::ModelConfig;
use super::kv_cache::SEQ_AXIS;
use super::layers::{join, Linear, Parameters, RmsNorm};
use super::rope::Rope;
use crate::error::{ModelError, Result};

/// Per-call values shared by every layer of one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct LayerContext<'a> {
    pub rope: &'a Rope,
    /// Rotary window rows for the chunk's absolute positions.
    pub freqs_cos: &'a Tensor,
    pub freqs_sin: &'a Tensor,
    /// Additive mask `[seq_len, cache_len + seq_len]` as f32.
    pub mask: &'a [f32],
    pub seq_len: usize,
}

/// Output of one attention layer.
#[derive(Debug)]
pub struct AttentionOutput {
    /// `[seq_len, dim]`
    pub output: Vec<f32>,
    /// `[1, n_kv_heads, seq_len, head_dim]`, before grouped-query expansion.
    pub new_k: Tensor,
    pub new_v: Tensor,
}

/// Multi-head self-attention over a cache plus the current chunk.
#[derive(Debug, Clone)]
pub struct Attention {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub n_rep: usize,
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    /// Per-head query/key norms, present when `use_qk_norm` is set.
    pub q_norm: Option<RmsNorm>,
    pub k_norm: Option<RmsNorm>,
    pub qk_norm_before_rope: bool,
}

impl Attention {
    pub fn new(config: &ModelConfig) -> Attention {
        let q_dim = config.n_heads * config.head_dim;
        let kv_dim = config.n_kv_heads * config.head_dim;
        let (q_norm, k_norm) = if config.use_qk_norm {
            (
                Some(RmsNorm::new(config.head_dim, config.norm_eps)),
                Some(RmsNorm::new(config.head_dim, config.norm_eps)),
            )
        } else {
            (None, None)
        };
        Attention {
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
            n_rep: config.n_rep(),
            wq: Linear::new(config.dim, q_dim),
            wk: Linear::new(config.dim, kv_dim),
            wv: Linear::new(config.dim, kv_dim),
            wo: Linear::new(q_dim, config.dim),
            q_norm,
            k_norm,
            qk_norm_before_rope: config.qk_norm_before_rope,
        }
    }

    fn apply_qk_norm(
        &self,
        q: Vec<f32>,
        k: Vec<f32>,
        backend: &dyn ComputeBackend,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        match (&self.q_norm, &self.k_norm) {
            (Some(qn), Some(kn)) => Ok((qn.forward(&q, backend)?, kn.forward(&k, backend)?)),
            _ => Ok((q, k)),
        }
    }

    /// Attend the chunk `x` (`[seq_len, dim]`) over `k_cache`/`v_cache`
    /// (`[1, n_kv_heads, cache_len, head_dim]`) followed by the chunk itself.
    pub fn forward(
        &self,
        x: &[f32],
        ctx: &LayerContext<'_>,
        k_cache: &Tensor,
        v_cache: &Tensor,
        backend: &dyn ComputeBackend,
    ) -> Result<AttentionOutput> {
        let seq = ctx.seq_len;
        let hd = self.head_dim;

        let q = self.wq.forward(x, seq, backend)?;
        let k = self.wk.forward(x, seq, backend)?;
        let v = self.wv.forward(x, seq, backend)?;

        let (mut q, mut k) = if self.qk_norm_before_rope {
            self.apply_qk_norm(q, k, backend)?
        } else {
            (q, k)
        };
        ctx.rope
            .apply(&mut q, self.n_heads, hd, ctx.freqs_cos, ctx.freqs_sin)?;
        ctx.rope
            .apply(&mut k, self.n_kv_heads, hd, ctx.freqs_cos, ctx.freqs_sin)?;
        let (q, k) = if self.qk_norm_before_rope {
            (q, k)
        } else {
            self.apply_qk_norm(q, k, backend)?
        };

        // [1, seq, heads, hd] -> [1, heads, seq, hd]
        let q = Tensor::from_vec(q, [1, seq, self.n_heads, hd])?.transpose(1, 2)?;
        let new_k = Tensor::from_vec(k, [1, seq, self.n_kv_heads, hd])?.transpose(1, 2)?;
        let new_v = Tensor::from_vec(v, [1, seq, self.n_kv_heads, hd])?.transpose(1, 2)?;

        let k_cache = k_cache.to_dtype(DType::F32);
        let v_cache = v_cache.to_dtype(DType::F32);
        let mut keys = Tensor::cat(&[&k_cache, &new_k], SEQ_AXIS)?;
        let mut values = Tensor::cat(&[&v_cache, &new_v], SEQ_AXIS)?;
        if self.n_rep > 1 {
            keys = keys.repeat_interleave(self.n_rep, 1)?;
            values = values.repeat_interleave(self.n_rep, 1)?;
        }

        let kv_len = keys.dims()[SEQ_AXIS];
        if ctx.mask.len() != seq * kv_len {
            return Err(ModelError::ShapeMismatch {
                what: "attention mask".to_string(),
                expected: vec![seq, kv_len],
                got: vec![ctx.mask.len()],
            });
        }

        let attn = backend.attention(
            q.as_f32_slice()?,
            keys.as_f32_slice()?,
            values.as_f32_slice()?,
            ctx.mask,
            self.n_heads,
            seq,
            kv_len,
            hd,
        )?;
        let merged = Tensor::from_vec(attn, [1, self.n_heads, seq, hd])?.transpose(1, 2)?;
        let output = self.wo.forward(merged.as_f32_slice()?, seq, backend)?;

        Ok(AttentionOutput {
            output,
            new_k,
            new_v,
        })
    }
}

impl Parameters for Attention {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.wq.named_parameters(&join(prefix, "wq"), out);
        self.wk.named_parameters(&join(prefix, "wk"), out);
        self.wv.named_parameters(&join(prefix, "wv"), out);
        self.wo.named_parameters(&join(prefix, "wo"), out);
        if let Some(n) = &self.q_norm {
            n.named_parameters(&join(prefix, "q_norm_fn"), out);
        }
        if let Some(n) = &self.k_norm {
            n.named_parameters(&join(prefix, "k_norm_fn"), out);
        }
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    ) {
        self.wq.named_parameters_mut(&join(prefix, "wq"), out);
        self.wk.named_parameters_mut(&join(prefix, "wk"), out);
        self.wv.named_parameters_mut(&join(prefix, "wv"), out);
        self.wo.named_parameters_mut(&join(prefix, "wo"), out);
        if let Some(n) = &mut self.q_norm {
            n.named_parameters_mut(&join(prefix, "q_norm_fn"), out);
        }
        if let Some(n) = &mut self.k_norm {
            n.named_parameters_mut(&join(prefix, "k_norm_fn"), out);
        }
    }
}
