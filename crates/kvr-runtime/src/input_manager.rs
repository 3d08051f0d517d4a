//! Host-side owner of the KV cache and attention mask.
//!
//! The model never keeps state between calls. `InputManager` turns a token
//! stream into fixed-length chunks, hands the model the current cache and
//! mask, and merges the keys and values each call returns back into a
//! circular buffer of `cache_size` positions.
//!
//! Two counters drive everything:
//! - `input_pos`: tokens submitted so far, unbounded. Feeds the rotary
//!   window and decides which mask columns to reveal.
//! - `cache_pos`: next slot to overwrite, in `0..cache_size`.
//!
//! Mask columns are revealed once and never re-masked, even after the slot
//! behind them has been overwritten by a later wrap.

use kvr_model::llama::{CacheLayout, KvStore, ModelConfig};
use kvr_model::ForwardInputs;
use kvr_tensor::{DType, Tensor};
use tracing::debug;

use crate::error::{Result, RuntimeError};

/// Sizes and element type of a session's cache.
#[derive(Debug, Clone, PartialEq)]
pub struct InputManagerConfig {
    pub n_layers: usize,
    pub max_batch_size: usize,
    pub n_kv_heads: usize,
    /// Total context: cache plus one chunk.
    pub max_seq_length: usize,
    pub head_dim: usize,
    pub use_cache_list: bool,
    /// Chunk length of every forward call.
    pub seq_length: usize,
    /// Element type of the caches and the mask.
    pub dtype: DType,
    /// Value written to masked mask entries.
    pub minus_infinity: f32,
    /// Defaults to `max_seq_length - seq_length`.
    pub cache_size: Option<usize>,
}

impl InputManagerConfig {
    pub fn new(
        n_layers: usize,
        n_kv_heads: usize,
        head_dim: usize,
        max_seq_length: usize,
        seq_length: usize,
    ) -> InputManagerConfig {
        InputManagerConfig {
            n_layers,
            max_batch_size: 1,
            n_kv_heads,
            max_seq_length,
            head_dim,
            use_cache_list: true,
            seq_length,
            dtype: DType::F16,
            minus_infinity: f32::NEG_INFINITY,
            cache_size: None,
        }
    }

    /// Cache geometry matching a model's config.
    pub fn for_model(
        config: &ModelConfig,
        max_seq_length: usize,
        seq_length: usize,
    ) -> InputManagerConfig {
        InputManagerConfig {
            max_batch_size: config.max_batch_size,
            use_cache_list: config.use_cache_list,
            ..InputManagerConfig::new(
                config.n_layers,
                config.n_kv_heads,
                config.head_dim,
                max_seq_length,
                seq_length,
            )
        }
    }
}

/// One chunk's worth of model inputs, borrowing the manager's buffers.
#[derive(Debug)]
pub struct ModelInputs<'a> {
    /// Chunk tokens, right-padded with zeros to `seq_length`.
    pub tokens: Vec<i64>,
    pub input_pos: i64,
    /// Number of real tokens before the padding.
    pub input_length: i64,
    pub k_caches: &'a dyn KvStore,
    pub v_caches: &'a dyn KvStore,
    pub attn_mask: &'a Tensor,
}

impl ModelInputs<'_> {
    pub fn as_forward_inputs(&self) -> ForwardInputs<'_> {
        ForwardInputs {
            tokens: Some(self.tokens.as_slice()),
            embedding: None,
            input_pos: self.input_pos,
            input_length: self.input_length,
            k_caches: self.k_caches,
            v_caches: self.v_caches,
            attn_mask: self.attn_mask,
        }
    }
}

/// Circular KV cache plus attention mask for one sequence.
#[derive(Debug)]
pub struct InputManager {
    n_layers: usize,
    max_batch_size: usize,
    n_kv_heads: usize,
    head_dim: usize,
    seq_length: usize,
    cache_size: usize,
    layout: CacheLayout,
    dtype: DType,
    k_caches: Box<dyn KvStore>,
    v_caches: Box<dyn KvStore>,
    attn_mask: Tensor,
    input_pos: usize,
    cache_pos: usize,
}

impl InputManager {
    pub fn new(config: InputManagerConfig) -> Result<InputManager> {
        if config.seq_length == 0 {
            return Err(RuntimeError::InvalidConfig(
                "seq_length must be > 0".to_string(),
            ));
        }
        let cache_size = match config.cache_size {
            Some(size) => size,
            None => config
                .max_seq_length
                .checked_sub(config.seq_length)
                .ok_or_else(|| {
                    RuntimeError::InvalidConfig(format!(
                        "seq_length {} exceeds max_seq_length {}",
                        config.seq_length, config.max_seq_length
                    ))
                })?,
        };
        if cache_size + config.seq_length > config.max_seq_length {
            return Err(RuntimeError::InvalidConfig(format!(
                "cache_size {} + seq_length {} exceeds max_seq_length {}",
                cache_size, config.seq_length, config.max_seq_length
            )));
        }

        let layout = CacheLayout::from_flag(config.use_cache_list);
        let layer_shape = [
            config.max_batch_size,
            config.n_kv_heads,
            cache_size,
            config.head_dim,
        ];
        let k_caches = layout.zeros(config.n_layers, layer_shape, config.dtype);
        let v_caches = layout.zeros(config.n_layers, layer_shape, config.dtype);

        let seq = config.seq_length;
        let width = cache_size + seq;
        let mut mask = Vec::with_capacity(seq * width);
        for row in 0..seq {
            mask.extend(std::iter::repeat(config.minus_infinity).take(cache_size));
            mask.extend((0..seq).map(|col| {
                if col > row {
                    config.minus_infinity
                } else {
                    0.0
                }
            }));
        }
        let attn_mask = Tensor::from_vec(mask, [seq, width])?.to_dtype(config.dtype);

        let cache_bytes = 2
            * config.n_layers
            * layer_shape.iter().product::<usize>()
            * config.dtype.size_in_bytes();
        debug!(
            cache_size,
            cache_bytes,
            seq_length = seq,
            n_layers = config.n_layers,
            layout = ?layout,
            "allocated kv cache"
        );

        Ok(InputManager {
            n_layers: config.n_layers,
            max_batch_size: config.max_batch_size,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
            seq_length: seq,
            cache_size,
            layout,
            dtype: config.dtype,
            k_caches,
            v_caches,
            attn_mask,
            input_pos: 0,
            cache_pos: 0,
        })
    }

    /// Full cache shape for `length` positions in this manager's layout.
    pub fn get_cache_shape(&self, length: usize) -> Vec<usize> {
        self.layout.cache_shape(
            self.n_layers,
            [self.max_batch_size, self.n_kv_heads, length, self.head_dim],
        )
    }

    fn check_new_cache(&self, what: &str, cache: &dyn KvStore) -> Result<()> {
        if cache.layout() != self.layout {
            return Err(RuntimeError::LayoutMismatch {
                expected: self.layout,
                got: cache.layout(),
            });
        }
        let expected = [
            self.n_layers,
            self.max_batch_size,
            self.n_kv_heads,
            self.seq_length,
            self.head_dim,
        ];
        let mut got = vec![cache.n_layers()];
        got.extend_from_slice(cache.layer_shape());
        if got != expected {
            return Err(RuntimeError::ShapeMismatch {
                what: what.to_string(),
                expected: expected.to_vec(),
                got,
            });
        }
        Ok(())
    }

    /// Copy chunk positions `start..start + length` of the new keys and
    /// values into the cache at `cache_pos`, then advance `cache_pos`,
    /// wrapping to 0 exactly at `cache_size`.
    pub fn update_cache(
        &mut self,
        start: usize,
        length: usize,
        new_k: &dyn KvStore,
        new_v: &dyn KvStore,
    ) -> Result<()> {
        if self.cache_pos + length > self.cache_size {
            return Err(RuntimeError::CacheOverflow {
                cache_pos: self.cache_pos,
                len: length,
                cache_size: self.cache_size,
            });
        }
        if start + length > self.seq_length {
            return Err(RuntimeError::ChunkTooLong {
                got: start + length,
                seq_length: self.seq_length,
            });
        }
        self.check_new_cache("new k cache", new_k)?;
        self.check_new_cache("new v cache", new_v)?;

        if length > 0 {
            for layer in 0..self.n_layers {
                self.k_caches
                    .write_span(layer, self.cache_pos, &new_k.get(layer)?, start, length)?;
                self.v_caches
                    .write_span(layer, self.cache_pos, &new_v.get(layer)?, start, length)?;
            }
        }
        debug!(start, length, cache_pos = self.cache_pos, "cache write");

        self.cache_pos += length;
        if self.cache_pos == self.cache_size {
            self.cache_pos = 0;
            debug!(input_pos = self.input_pos, "cache wrapped");
        }
        Ok(())
    }

    /// Merge one forward call's keys and values for `input_length` real
    /// tokens.
    ///
    /// Writes run up to the physical end of the buffer, then continue from
    /// slot 0; at most two writes per call. Mask columns are revealed only
    /// while `input_pos <= cache_size`, and never past the cache region.
    pub fn update(
        &mut self,
        input_length: usize,
        new_k: &dyn KvStore,
        new_v: &dyn KvStore,
    ) -> Result<()> {
        if input_length > self.seq_length {
            return Err(RuntimeError::ChunkTooLong {
                got: input_length,
                seq_length: self.seq_length,
            });
        }

        let amount = input_length.min(self.cache_size - self.cache_pos);
        let wrapped_pos = if self.cache_pos + amount == self.cache_size {
            0
        } else {
            self.cache_pos + amount
        };
        let remaining = (input_length - amount).min(self.cache_size - wrapped_pos);
        if self.cache_size > 0 && amount + remaining < input_length {
            return Err(RuntimeError::CacheOverflow {
                cache_pos: self.cache_pos,
                len: input_length,
                cache_size: self.cache_size,
            });
        }

        self.update_cache(0, amount, new_k, new_v)?;

        if self.input_pos <= self.cache_size {
            let end = (self.input_pos + amount).min(self.cache_size);
            if end > self.input_pos {
                let cols = end - self.input_pos;
                let zeros = Tensor::full([self.seq_length, cols], 0.0, self.dtype);
                self.attn_mask.assign_region(&[0, self.input_pos], &zeros)?;
                debug!(from = self.input_pos, to = end, "revealed mask columns");
            }
        }

        if remaining > 0 {
            self.update_cache(amount, remaining, new_k, new_v)?;
        }

        self.input_pos += input_length;
        Ok(())
    }

    /// Model inputs for `tokens`, zero-padded to `seq_length`.
    pub fn get_inputs(&self, tokens: &[i64]) -> Result<ModelInputs<'_>> {
        if tokens.len() > self.seq_length {
            return Err(RuntimeError::ChunkTooLong {
                got: tokens.len(),
                seq_length: self.seq_length,
            });
        }
        let mut padded = tokens.to_vec();
        padded.resize(self.seq_length, 0);
        Ok(ModelInputs {
            tokens: padded,
            input_pos: self.input_pos as i64,
            input_length: tokens.len() as i64,
            k_caches: self.k_caches.as_ref(),
            v_caches: self.v_caches.as_ref(),
            attn_mask: &self.attn_mask,
        })
    }

    /// Inputs for the next chunk (at most `seq_length` tokens) and the
    /// tokens left over for later calls.
    pub fn get_inputs_and_remaining_tokens<'t>(
        &self,
        tokens: &'t [i64],
    ) -> Result<(ModelInputs<'_>, &'t [i64])> {
        let processed = self.seq_length.min(tokens.len());
        let (chunk, rest) = tokens.split_at(processed);
        Ok((self.get_inputs(chunk)?, rest))
    }

    pub fn input_pos(&self) -> usize {
        self.input_pos
    }

    pub fn cache_pos(&self) -> usize {
        self.cache_pos
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    pub fn attn_mask(&self) -> &Tensor {
        &self.attn_mask
    }

    pub fn k_caches(&self) -> &dyn KvStore {
        self.k_caches.as_ref()
    }

    pub fn v_caches(&self) -> &dyn KvStore {
        self.v_caches.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const N_LAYERS: usize = 2;
    const KV_HEADS: usize = 2;
    const HEAD_DIM: usize = 3;

    fn manager(max_seq_length: usize, seq_length: usize, use_cache_list: bool) -> InputManager {
        InputManager::new(InputManagerConfig {
            use_cache_list,
            dtype: DType::F32,
            ..InputManagerConfig::new(N_LAYERS, KV_HEADS, HEAD_DIM, max_seq_length, seq_length)
        })
        .unwrap()
    }

    /// New keys for a chunk starting at absolute position `start`: every
    /// element of chunk row `p` in layer `l` is `1000 * l + start + p + 1`.
    /// Padding rows past `len` hold -1.
    fn chunk(m: &InputManager, start: usize, len: usize) -> Box<dyn KvStore> {
        let seq = m.seq_length();
        let layers = (0..N_LAYERS)
            .map(|l| {
                let mut data = Vec::new();
                for _ in 0..KV_HEADS {
                    for p in 0..seq {
                        let v = if p < len {
                            (1000 * l + start + p + 1) as f32
                        } else {
                            -1.0
                        };
                        data.extend(std::iter::repeat(v).take(HEAD_DIM));
                    }
                }
                Tensor::new(data, [1, KV_HEADS, seq, HEAD_DIM])
            })
            .collect();
        m.layout().from_layers(layers).unwrap()
    }

    fn submit(m: &mut InputManager, len: usize) {
        let start = m.input_pos();
        let k = chunk(m, start, len);
        let v = chunk(m, start, len);
        m.update(len, k.as_ref(), v.as_ref()).unwrap();
    }

    fn cache_value(m: &InputManager, layer: usize, col: usize) -> f32 {
        m.k_caches()
            .get(layer)
            .unwrap()
            .get(&[0, KV_HEADS - 1, col, HEAD_DIM - 1])
            .unwrap()
    }

    fn revealed(m: &InputManager) -> Vec<bool> {
        (0..m.cache_size())
            .map(|c| m.attn_mask().get(&[0, c]).unwrap() == 0.0)
            .collect()
    }

    fn assert_chunk_region_causal(m: &InputManager) {
        let seq = m.seq_length();
        for row in 0..seq {
            for col in 0..seq {
                let v = m.attn_mask().get(&[row, m.cache_size() + col]).unwrap();
                if col > row {
                    assert_eq!(v, f32::NEG_INFINITY, "row {row} col {col}");
                } else {
                    assert_eq!(v, 0.0, "row {row} col {col}");
                }
            }
        }
    }

    #[test]
    fn test_construction() {
        for flag in [true, false] {
            let m = manager(16, 4, flag);
            assert_eq!(m.cache_size(), 12);
            assert_eq!(m.input_pos(), 0);
            assert_eq!(m.cache_pos(), 0);
            assert_eq!(m.attn_mask().dims(), &[4, 16]);
            assert!(revealed(&m).iter().all(|r| !r));
            assert_chunk_region_causal(&m);
            assert_eq!(m.k_caches().layer_shape(), &[1, KV_HEADS, 12, HEAD_DIM]);
        }
        assert_eq!(manager(16, 4, true).get_cache_shape(12), vec![1, 2, 12, 3]);
        assert_eq!(manager(16, 4, false).get_cache_shape(4), vec![2, 1, 2, 4, 3]);
    }

    #[test]
    fn test_default_dtype_and_config_errors() {
        let m = InputManager::new(InputManagerConfig::new(1, 1, 2, 8, 2)).unwrap();
        assert_eq!(m.k_caches().dtype(), DType::F16);
        assert_eq!(m.attn_mask().dtype(), DType::F16);
        assert_eq!(m.attn_mask().get(&[0, 0]).unwrap(), f32::NEG_INFINITY);

        assert!(InputManager::new(InputManagerConfig::new(1, 1, 2, 3, 4)).is_err());
        assert!(InputManager::new(InputManagerConfig::new(1, 1, 2, 8, 0)).is_err());
        let too_big = InputManagerConfig {
            cache_size: Some(7),
            ..InputManagerConfig::new(1, 1, 2, 8, 2)
        };
        assert!(InputManager::new(too_big).is_err());
    }

    #[test]
    fn test_explicit_cache_size_and_minus_infinity() {
        let m = InputManager::new(InputManagerConfig {
            cache_size: Some(3),
            minus_infinity: -1e4,
            dtype: DType::F32,
            ..InputManagerConfig::new(1, 1, 2, 8, 2)
        })
        .unwrap();
        assert_eq!(m.cache_size(), 3);
        assert_eq!(m.attn_mask().dims(), &[2, 5]);
        assert_eq!(m.attn_mask().get(&[1, 2]).unwrap(), -1e4);
        assert_eq!(m.attn_mask().get(&[0, 4]).unwrap(), -1e4);
        assert_eq!(m.attn_mask().get(&[1, 4]).unwrap(), 0.0);
    }

    #[test]
    fn test_sixteen_four_twenty_scenario() {
        for flag in [true, false] {
            let mut m = manager(16, 4, flag);
            for _ in 0..3 {
                submit(&mut m, 4);
            }
            assert_eq!(m.input_pos(), 12);
            assert_eq!(m.cache_pos(), 0);
            assert!(revealed(&m).iter().all(|&r| r));

            submit(&mut m, 4);
            // tokens 13..=16 overwrote columns 0..4
            for col in 0..4 {
                assert_eq!(cache_value(&m, 1, col), (1000 + 12 + col + 1) as f32);
            }
            assert_eq!(cache_value(&m, 1, 4), (1000 + 5) as f32);

            submit(&mut m, 4);
            assert_eq!(m.input_pos(), 20);
            assert_eq!(m.cache_pos(), 20 % 12);
            assert!(revealed(&m).iter().all(|&r| r));
            assert_chunk_region_causal(&m);
            for col in 0..8 {
                assert_eq!(cache_value(&m, 0, col), (12 + col + 1) as f32);
            }
            for col in 8..12 {
                assert_eq!(cache_value(&m, 0, col), (col + 1) as f32);
            }
        }
    }

    #[test]
    fn test_split_write_across_wrap() {
        let mut m = manager(9, 4, true);
        assert_eq!(m.cache_size(), 5);
        submit(&mut m, 3);
        assert_eq!(m.cache_pos(), 3);
        // 4 tokens: 2 at the end, 2 wrapped to the front
        submit(&mut m, 4);
        assert_eq!(m.cache_pos(), 2);
        assert_eq!(m.input_pos(), 7);
        let values: Vec<f32> = (0..5).map(|c| cache_value(&m, 0, c)).collect();
        assert_eq!(values, vec![6.0, 7.0, 3.0, 4.0, 5.0]);
        // padding rows never reach the cache
        assert!(values.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_random_schedules_track_positions_and_contents() {
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..20 {
            let seq = rng.gen_range(1..=5);
            let max = seq + rng.gen_range((seq + 1) / 2..=12);
            let mut m = manager(max, seq, round % 2 == 0);
            let cap = m.cache_size();
            let mut total = 0;
            let mut ever_revealed = vec![false; cap];

            for _ in 0..rng.gen_range(1..40) {
                let len = rng.gen_range(1..=seq);
                submit(&mut m, len);
                total += len;

                assert_eq!(m.input_pos(), total);
                assert_eq!(m.cache_pos(), total % cap);

                let now = revealed(&m);
                for (col, (&before, &after)) in ever_revealed.iter().zip(&now).enumerate() {
                    assert!(!before || after, "column {col} re-masked");
                    assert_eq!(after, col < total, "column {col} after {total} tokens");
                }
                ever_revealed = now;
                assert_chunk_region_causal(&m);

                // each slot holds the latest token that maps onto it
                for col in 0..cap.min(total) {
                    let latest = (0..total).rev().find(|t| t % cap == col).unwrap();
                    assert_eq!(cache_value(&m, 1, col), (1000 + latest + 1) as f32);
                }
            }
        }
    }

    #[test]
    fn test_update_rejects_bad_chunks() {
        let mut m = manager(16, 4, true);
        let k = chunk(&m, 0, 4);
        assert!(matches!(
            m.update(5, k.as_ref(), k.as_ref()),
            Err(RuntimeError::ChunkTooLong { .. })
        ));

        let stacked = CacheLayout::Stacked
            .from_layers(vec![Tensor::zeros([1, KV_HEADS, 4, HEAD_DIM]); N_LAYERS])
            .unwrap();
        assert!(matches!(
            m.update(4, stacked.as_ref(), stacked.as_ref()),
            Err(RuntimeError::LayoutMismatch { .. })
        ));

        let wrong = CacheLayout::List
            .from_layers(vec![Tensor::zeros([1, KV_HEADS, 3, HEAD_DIM]); N_LAYERS])
            .unwrap();
        assert!(matches!(
            m.update(3, wrong.as_ref(), wrong.as_ref()),
            Err(RuntimeError::ShapeMismatch { .. })
        ));
        // failed calls leave the counters alone
        assert_eq!(m.input_pos(), 0);

        let mut small = InputManager::new(InputManagerConfig {
            cache_size: Some(1),
            dtype: DType::F32,
            ..InputManagerConfig::new(N_LAYERS, KV_HEADS, HEAD_DIM, 16, 4)
        })
        .unwrap();
        // three tokens cannot fit in two spans of one slot
        let k = chunk(&small, 0, 3);
        assert!(matches!(
            small.update(3, k.as_ref(), k.as_ref()),
            Err(RuntimeError::CacheOverflow { .. })
        ));
        assert!(small.update_cache(0, 3, k.as_ref(), k.as_ref()).is_err());
        assert_eq!(small.input_pos(), 0);
        assert_eq!(small.cache_pos(), 0);
    }

    #[test]
    fn test_chunk_longer_than_cache_wraps_within_one_call() {
        for flag in [true, false] {
            let mut m = manager(16, 10, flag);
            assert_eq!(m.cache_size(), 6);
            submit(&mut m, 10);
            assert_eq!(m.input_pos(), 10);
            assert_eq!(m.cache_pos(), 4);
            // tokens 1..=6 fill the buffer, 7..=10 wrap onto columns 0..4
            let values: Vec<f32> = (0..6).map(|c| cache_value(&m, 0, c)).collect();
            assert_eq!(values, vec![7.0, 8.0, 9.0, 10.0, 5.0, 6.0]);
            assert!(revealed(&m).iter().all(|&r| r));
            assert_chunk_region_causal(&m);
        }
    }

    #[test]
    fn test_get_inputs_pads_and_is_deterministic() {
        let m = manager(16, 4, true);
        let a = m.get_inputs(&[7, 8]).unwrap();
        let b = m.get_inputs(&[7, 8]).unwrap();
        assert_eq!(a.tokens, vec![7, 8, 0, 0]);
        assert_eq!(a.tokens, b.tokens);
        assert_eq!(a.input_length, 2);
        assert_eq!(a.input_pos, 0);
        assert_eq!(a.attn_mask.dims(), &[4, 16]);
        assert!(m.get_inputs(&[1, 2, 3, 4, 5]).is_err());

        let forward = a.as_forward_inputs();
        assert_eq!(forward.tokens, Some(&[7i64, 8, 0, 0][..]));
        assert!(forward.embedding.is_none());
    }

    #[test]
    fn test_get_inputs_and_remaining_tokens() {
        let mut m = manager(16, 4, true);
        let tokens: Vec<i64> = (1..=10).collect();
        let (inputs, rest) = m.get_inputs_and_remaining_tokens(&tokens).unwrap();
        assert_eq!(inputs.tokens, vec![1, 2, 3, 4]);
        assert_eq!(rest, &tokens[4..]);
        drop(inputs);
        submit(&mut m, 4);

        let (inputs, rest) = m.get_inputs_and_remaining_tokens(&tokens[8..]).unwrap();
        assert_eq!(inputs.tokens, vec![9, 10, 0, 0]);
        assert_eq!(inputs.input_pos, 4);
        assert_eq!(inputs.input_length, 2);
        assert!(rest.is_empty());
    }
}
