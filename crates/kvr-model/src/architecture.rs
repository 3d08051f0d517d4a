use std::fmt::Debug;

use kvr_tensor::{ComputeBackend, Tensor};

use crate::llama::{KvStore, ModelConfig};

/// Inputs of one fixed-shape forward call.
///
/// Exactly one of `tokens` and `embedding` must be set. The caches are read
/// only; the call returns the chunk's keys and values instead of writing
/// them, leaving the caller as the sole owner of cache state.
#[derive(Debug, Clone, Copy)]
pub struct ForwardInputs<'a> {
    /// Token ids of the chunk, `[seq_len]` (batch of one).
    pub tokens: Option<&'a [i64]>,
    /// Precomputed embeddings, `[1, seq_len, dim]`.
    pub embedding: Option<&'a Tensor>,
    /// Absolute position of the chunk's first token.
    pub input_pos: i64,
    /// Number of real (unpadded) tokens in the chunk.
    pub input_length: i64,
    pub k_caches: &'a dyn KvStore,
    pub v_caches: &'a dyn KvStore,
    /// `[seq_len, cache_len + seq_len]` additive mask.
    pub attn_mask: &'a Tensor,
}

/// Result of a forward call.
#[derive(Debug)]
pub struct ForwardOutput {
    /// `[1, vocab_size]`, or `[1, seq_len, vocab_size]` in full-logits mode.
    pub logits: Tensor,
    /// Per-layer `[1, n_kv_heads, seq_len, head_dim]` keys, in the model's
    /// cache layout.
    pub new_k: Box<dyn KvStore>,
    pub new_v: Box<dyn KvStore>,
}

/// Trait for decoder architectures driven by an external cache manager.
///
/// Implementations hold weights only. Each call is a pure function of its
/// inputs, so one model can serve any number of independent sessions.
pub trait ModelArchitecture: Send + Sync + Debug {
    /// Run the forward pass for one chunk.
    fn forward(
        &self,
        inputs: &ForwardInputs<'_>,
        backend: &dyn ComputeBackend,
    ) -> crate::Result<ForwardOutput>;

    /// Returns the vocabulary size (number of output logits).
    fn vocab_size(&self) -> usize;

    fn config(&self) -> &ModelConfig;
}
