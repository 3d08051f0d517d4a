pub mod attention;
pub mod block;
pub mod config;
pub mod feed_forward;
pub mod kv_cache;
pub mod layers;
pub mod rope;

pub use attention::{Attention, LayerContext};
pub use block::TransformerBlock;
pub use config::{ModelArgs, ModelConfig};
pub use feed_forward::{DenseFeedForward, FeedForward, MoeFeedForward};
pub use kv_cache::{CacheLayout, CacheList, KvStore, StackedCache};
pub use layers::{Linear, Parameters, RmsNorm};
pub use rope::{HfRotary, NativeRotary, Rope, RotaryConvention};

use kvr_tensor::{ComputeBackend, Tensor};
use tracing::{debug, info};

use crate::architecture::{ForwardInputs, ForwardOutput, ModelArchitecture};
use crate::error::{ModelError, Result};

/// A LLaMA-style decoder with an externally managed KV cache.
///
/// Holds configuration and weights only. The rotary tables live on the
/// `Rope` component and are not parameters.
#[derive(Debug)]
pub struct Transformer {
    config: ModelConfig,
    /// Token embedding matrix, shape [vocab_size, dim].
    pub tok_embeddings: Tensor,
    pub rope: Rope,
    pub layers: Vec<TransformerBlock>,
    /// Final norm before the LM head.
    pub norm: RmsNorm,
    /// LM head, shape [vocab_size, dim].
    pub output: Linear,
    cache_layout: CacheLayout,
}

impl Transformer {
    /// Build a model with placeholder weights: zero projections and
    /// unit norms. Real weights come from [`crate::loader::load_state_dict`].
    pub fn new(config: ModelConfig) -> Transformer {
        let layers = (0..config.n_layers)
            .map(|_| TransformerBlock::new(&config))
            .collect();
        let model = Transformer {
            tok_embeddings: Tensor::zeros([config.vocab_size, config.dim]),
            rope: Rope::new(&config),
            layers,
            norm: RmsNorm::new(config.dim, config.norm_eps),
            output: Linear::new(config.dim, config.vocab_size),
            cache_layout: CacheLayout::from_flag(config.use_cache_list),
            config,
        };
        info!(
            n_layers = model.config.n_layers,
            dim = model.config.dim,
            n_heads = model.config.n_heads,
            n_kv_heads = model.config.n_kv_heads,
            moe = model.config.moe,
            rope = model.rope.convention(),
            "built transformer"
        );
        model
    }

    pub fn cache_layout(&self) -> CacheLayout {
        self.cache_layout
    }

    /// Embedding rows for `tokens`, flattened `[seq_len, dim]`.
    fn embed(&self, tokens: &[i64]) -> Result<Vec<f32>> {
        let dim = self.config.dim;
        let table = self.tok_embeddings.as_f32_slice()?;
        let mut hidden = Vec::with_capacity(tokens.len() * dim);
        for &id in tokens {
            if id < 0 || id as usize >= self.config.vocab_size {
                return Err(ModelError::TokenOutOfRange {
                    id,
                    vocab_size: self.config.vocab_size,
                });
            }
            let start = id as usize * dim;
            hidden.extend_from_slice(&table[start..start + dim]);
        }
        Ok(hidden)
    }

    fn input_hidden(&self, inputs: &ForwardInputs<'_>) -> Result<(Vec<f32>, usize)> {
        match (inputs.tokens, inputs.embedding) {
            (Some(tokens), None) => Ok((self.embed(tokens)?, tokens.len())),
            (None, Some(h)) => {
                let dims = h.dims();
                if dims.len() != 3 || dims[0] != 1 || dims[2] != self.config.dim {
                    return Err(ModelError::ShapeMismatch {
                        what: "embedding".to_string(),
                        expected: vec![1, dims.get(1).copied().unwrap_or(0), self.config.dim],
                        got: dims.to_vec(),
                    });
                }
                Ok((h.to_f32_vec(), dims[1]))
            }
            (tokens, embedding) => Err(ModelError::InputConflict {
                tokens: tokens.is_some(),
                embedding: embedding.is_some(),
            }),
        }
    }

    /// Check both caches against the layout and per-layer shape this model
    /// expects; returns the cache length.
    fn check_caches(&self, inputs: &ForwardInputs<'_>) -> Result<usize> {
        let cache_len = inputs.k_caches.seq_len();
        let expected = vec![
            1,
            self.config.n_kv_heads,
            cache_len,
            self.config.head_dim,
        ];
        for cache in [inputs.k_caches, inputs.v_caches] {
            if cache.layout() != self.cache_layout {
                return Err(ModelError::LayoutMismatch {
                    expected: self.cache_layout,
                    got: cache.layout(),
                });
            }
            if cache.n_layers() != self.config.n_layers {
                return Err(ModelError::ShapeMismatch {
                    what: "kv cache layer count".to_string(),
                    expected: vec![self.config.n_layers],
                    got: vec![cache.n_layers()],
                });
            }
            if cache.layer_shape() != expected.as_slice() {
                return Err(ModelError::ShapeMismatch {
                    what: "kv cache layer".to_string(),
                    expected,
                    got: cache.layer_shape().to_vec(),
                });
            }
        }
        Ok(cache_len)
    }
}

impl ModelArchitecture for Transformer {
    /// Run one chunk through embedding, every block, the final norm and the
    /// LM head.
    ///
    /// The rotary window for `input_pos` is fetched once and shared by all
    /// layers. Unless full-logits mode is on, only the row of the last real
    /// token (`input_length - 1`) reaches the LM head.
    fn forward(
        &self,
        inputs: &ForwardInputs<'_>,
        backend: &dyn ComputeBackend,
    ) -> Result<ForwardOutput> {
        let dim = self.config.dim;
        let (mut hidden, seq_len) = self.input_hidden(inputs)?;
        if inputs.input_length < 1 || inputs.input_length as usize > seq_len {
            return Err(ModelError::InvalidInputLength {
                input_length: inputs.input_length,
                seq_len,
            });
        }

        let cache_len = self.check_caches(inputs)?;
        if inputs.attn_mask.dims() != [seq_len, cache_len + seq_len] {
            return Err(ModelError::ShapeMismatch {
                what: "attention mask".to_string(),
                expected: vec![seq_len, cache_len + seq_len],
                got: inputs.attn_mask.dims().to_vec(),
            });
        }
        let mask = inputs.attn_mask.to_f32_vec();
        let (freqs_cos, freqs_sin) = self.rope.get_freqs(inputs.input_pos, seq_len)?;
        let ctx = LayerContext {
            rope: &self.rope,
            freqs_cos: &freqs_cos,
            freqs_sin: &freqs_sin,
            mask: &mask,
            seq_len,
        };
        debug!(
            input_pos = inputs.input_pos,
            input_length = inputs.input_length,
            seq_len,
            cache_len,
            "forward"
        );

        let mut k_out = Vec::with_capacity(self.layers.len());
        let mut v_out = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let k_cache = inputs.k_caches.get(i)?;
            let v_cache = inputs.v_caches.get(i)?;
            let out = layer.forward(&hidden, &ctx, &k_cache, &v_cache, backend)?;
            hidden = out.hidden;
            k_out.push(out.new_k);
            v_out.push(out.new_v);
        }

        let rows = if self.config.generate_full_logits {
            seq_len
        } else {
            let last = inputs.input_length as usize - 1;
            hidden = hidden[last * dim..(last + 1) * dim].to_vec();
            1
        };
        let normed = self.norm.forward(&hidden, backend)?;
        let logits = self.output.forward(&normed, rows, backend)?;
        let logits = if self.config.generate_full_logits {
            Tensor::from_vec(logits, [1, seq_len, self.config.vocab_size])?
        } else {
            Tensor::from_vec(logits, [1, self.config.vocab_size])?
        };

        Ok(ForwardOutput {
            logits,
            new_k: self.cache_layout.from_layers(k_out)?,
            new_v: self.cache_layout.from_layers(v_out)?,
        })
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl Parameters for Transformer {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((layers::join(prefix, "tok_embeddings.weight"), &self.tok_embeddings));
        for (i, layer) in self.layers.iter().enumerate() {
            layer.named_parameters(&layers::join(prefix, &format!("layers.{i}")), out);
        }
        self.norm.named_parameters(&layers::join(prefix, "norm"), out);
        self.output
            .named_parameters(&layers::join(prefix, "output"), out);
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    ) {
        out.push((
            layers::join(prefix, "tok_embeddings.weight"),
            &mut self.tok_embeddings,
        ));
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.named_parameters_mut(&layers::join(prefix, &format!("layers.{i}")), out);
        }
        self.norm
            .named_parameters_mut(&layers::join(prefix, "norm"), out);
        self.output
            .named_parameters_mut(&layers::join(prefix, "output"), out);
    }
}
