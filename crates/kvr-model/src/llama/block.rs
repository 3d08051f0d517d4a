use kvr_tensor::{ComputeBackend, Tensor};

use super::attention::{Attention, LayerContext};
use super::config::ModelConfig;
use super::feed_forward::{self, FeedForward};
use super::layers::{join, Parameters, RmsNorm};
use crate::error::Result;

/// One pre-norm decoder layer: attention then feed-forward, each with a
/// residual connection.
#[derive(Debug)]
pub struct TransformerBlock {
    pub attention: Attention,
    pub feed_forward: Box<dyn FeedForward>,
    pub attention_norm: RmsNorm,
    pub ffn_norm: RmsNorm,
}

/// Hidden state after one block plus the chunk's keys and values.
#[derive(Debug)]
pub struct BlockOutput {
    pub hidden: Vec<f32>,
    pub new_k: Tensor,
    pub new_v: Tensor,
}

impl TransformerBlock {
    pub fn new(config: &ModelConfig) -> TransformerBlock {
        TransformerBlock {
            attention: Attention::new(config),
            feed_forward: feed_forward::build(config),
            attention_norm: RmsNorm::new(config.dim, config.norm_eps),
            ffn_norm: RmsNorm::new(config.dim, config.norm_eps),
        }
    }

    pub fn forward(
        &self,
        x: &[f32],
        ctx: &LayerContext<'_>,
        k_cache: &Tensor,
        v_cache: &Tensor,
        backend: &dyn ComputeBackend,
    ) -> Result<BlockOutput> {
        let normed = self.attention_norm.forward(x, backend)?;
        let attn = self
            .attention
            .forward(&normed, ctx, k_cache, v_cache, backend)?;
        let h = backend.add(x, &attn.output)?;

        let ffn_in = self.ffn_norm.forward(&h, backend)?;
        let ffn_out = self.feed_forward.apply(&ffn_in, ctx.seq_len, backend)?;
        let hidden = backend.add(&h, &ffn_out)?;

        Ok(BlockOutput {
            hidden,
            new_k: attn.new_k,
            new_v: attn.new_v,
        })
    }
}

impl Parameters for TransformerBlock {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.attention
            .named_parameters(&join(prefix, "attention"), out);
        let ffn_prefix = join(prefix, self.feed_forward.module_name());
        self.feed_forward.named_parameters(&ffn_prefix, out);
        self.attention_norm
            .named_parameters(&join(prefix, "attention_norm"), out);
        self.ffn_norm.named_parameters(&join(prefix, "ffn_norm"), out);
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    ) {
        self.attention
            .named_parameters_mut(&join(prefix, "attention"), out);
        let ffn_prefix = join(prefix, self.feed_forward.module_name());
        self.feed_forward.named_parameters_mut(&ffn_prefix, out);
        self.attention_norm
            .named_parameters_mut(&join(prefix, "attention_norm"), out);
        self.ffn_norm
            .named_parameters_mut(&join(prefix, "ffn_norm"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llama::rope::Rope;
    use approx::assert_relative_eq;
    use kvr_tensor::CpuBackend;

    #[test]
    fn test_zero_weights_are_identity() {
        let config = ModelConfig::from_json_str(
            r#"{"dim": 4, "n_layers": 1, "n_heads": 2, "vocab_size": 8,
                "hidden_dim": 8, "max_seq_len": 8, "max_context_len": 8}"#,
        )
        .unwrap();
        let block = TransformerBlock::new(&config);
        let rope = Rope::new(&config);
        let (cos, sin) = rope.get_freqs(0, 2).unwrap();
        let mask = vec![0.0, 0.0, f32::NEG_INFINITY, 0.0, 0.0, 0.0];
        let ctx = LayerContext {
            rope: &rope,
            freqs_cos: &cos,
            freqs_sin: &sin,
            mask: &mask,
            seq_len: 2,
        };
        let cache = Tensor::zeros([1, 2, 1, 2]);
        let x: Vec<f32> = (0..8).map(|i| i as f32 - 3.5).collect();
        let out = block
            .forward(&x, &ctx, &cache, &cache, &CpuBackend::new())
            .unwrap();
        for (a, b) in out.hidden.iter().zip(&x) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
        assert_eq!(out.new_k.dims(), &[1, 2, 2, 2]);
    }

    #[test]
    fn test_moe_block_parameter_prefix() {
        let config = ModelConfig::from_json_str(
            r#"{"dim": 4, "n_layers": 1, "n_heads": 2, "vocab_size": 8,
                "hidden_dim": 8, "moe": true}"#,
        )
        .unwrap();
        let block = TransformerBlock::new(&config);
        let mut out = Vec::new();
        block.named_parameters("layers.3", &mut out);
        let names: Vec<&str> = out.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"layers.3.block_sparse_moe.gate.weight"));
        assert!(names.contains(&"layers.3.attention_norm.weight"));
        assert!(!names.iter().any(|n| n.contains("feed_forward")));
        assert_eq!(names.len(), 4 + 4 + 2);
    }
}
