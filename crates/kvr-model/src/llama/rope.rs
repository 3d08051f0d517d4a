//! Rotary position embeddings.
//!
//! The frequency tables are precomputed once per model and owned by [`Rope`].
//! They are runtime state, not parameters: they are never listed, loaded or
//! saved with the checkpoint. Each forward call takes a window of rows
//! matching the absolute positions of the chunk.

use std::f32::consts::PI;
use std::fmt::Debug;

use kvr_tensor::Tensor;
use tracing::debug;

use super::config::ModelConfig;
use crate::error::{ModelError, Result};

/// Context length the llama-3.1 frequency scaling was tuned for.
const SCALED_ROPE_OLD_CONTEXT_LEN: f32 = 8192.0;
const SCALED_ROPE_LOW_FREQ_FACTOR: f32 = 1.0;

/// A rotary convention: how tables are laid out and how a head vector is
/// rotated by one table row.
pub trait RotaryConvention: Send + Sync + Debug {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Build `(cos, sin)` tables of shape `[rows, width]`.
    fn precompute(&self, head_dim: usize, rows: usize, theta: f32) -> (Tensor, Tensor);

    /// Rotate one head vector in place using a single table row.
    fn rotate(&self, x: &mut [f32], cos: &[f32], sin: &[f32]);
}

/// Meta-llama convention: consecutive feature pairs `(2i, 2i + 1)` are
/// rotated as complex numbers. Tables are `[rows, head_dim / 2]`.
#[derive(Debug, Clone)]
pub struct NativeRotary {
    pub use_scaled: bool,
    pub scale_factor: f32,
    pub high_freq_factor: f32,
}

impl NativeRotary {
    /// Base inverse frequencies, optionally rescaled for long context.
    pub fn inv_freqs(&self, head_dim: usize, theta: f32) -> Vec<f32> {
        let freqs = base_freqs(head_dim, theta);
        if self.use_scaled {
            scale_freqs(&freqs, self.scale_factor, self.high_freq_factor)
        } else {
            freqs
        }
    }
}

impl RotaryConvention for NativeRotary {
    fn name(&self) -> &str {
        "native"
    }

    fn precompute(&self, head_dim: usize, rows: usize, theta: f32) -> (Tensor, Tensor) {
        let freqs = self.inv_freqs(head_dim, theta);
        outer_tables(&freqs, rows, false)
    }

    fn rotate(&self, x: &mut [f32], cos: &[f32], sin: &[f32]) {
        for (i, (&c, &s)) in cos.iter().zip(sin).enumerate() {
            let re = x[2 * i];
            let im = x[2 * i + 1];
            x[2 * i] = re * c - im * s;
            x[2 * i + 1] = re * s + im * c;
        }
    }
}

/// HuggingFace convention: the first and second halves of the rotary span
/// are paired (`rotate_half`). Only the leading
/// `head_dim * partial_rotary_factor` features rotate; the rest pass
/// through. Tables are `[rows, rotary_dim]` with the frequencies repeated.
#[derive(Debug, Clone)]
pub struct HfRotary {
    pub partial_rotary_factor: f32,
}

impl HfRotary {
    pub fn rotary_dim(&self, head_dim: usize) -> usize {
        let dim = (head_dim as f32 * self.partial_rotary_factor) as usize;
        dim - dim % 2
    }
}

impl RotaryConvention for HfRotary {
    fn name(&self) -> &str {
        "hf"
    }

    fn precompute(&self, head_dim: usize, rows: usize, theta: f32) -> (Tensor, Tensor) {
        let freqs = base_freqs(self.rotary_dim(head_dim), theta);
        outer_tables(&freqs, rows, true)
    }

    fn rotate(&self, x: &mut [f32], cos: &[f32], sin: &[f32]) {
        let half = cos.len() / 2;
        for j in 0..half {
            let x1 = x[j];
            let x2 = x[j + half];
            x[j] = x1 * cos[j] - x2 * sin[j];
            x[j + half] = x2 * cos[j + half] + x1 * sin[j + half];
        }
    }
}

/// `1 / theta^(2i / dim)` for `i < dim / 2`.
fn base_freqs(dim: usize, theta: f32) -> Vec<f32> {
    (0..dim / 2)
        .map(|i| 1.0 / theta.powf((2 * i) as f32 / dim as f32))
        .collect()
}

/// Llama-3.1 frequency scaling: short wavelengths are kept, long ones are
/// divided by `scale_factor`, and the band between is interpolated.
fn scale_freqs(freqs: &[f32], scale_factor: f32, high_freq_factor: f32) -> Vec<f32> {
    let low_freq_wavelen = SCALED_ROPE_OLD_CONTEXT_LEN / SCALED_ROPE_LOW_FREQ_FACTOR;
    let high_freq_wavelen = SCALED_ROPE_OLD_CONTEXT_LEN / high_freq_factor;
    freqs
        .iter()
        .map(|&freq| {
            let wavelen = 2.0 * PI / freq;
            if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / scale_factor
            } else {
                let smooth = (SCALED_ROPE_OLD_CONTEXT_LEN / wavelen - SCALED_ROPE_LOW_FREQ_FACTOR)
                    / (high_freq_factor - SCALED_ROPE_LOW_FREQ_FACTOR);
                (1.0 - smooth) * freq / scale_factor + smooth * freq
            }
        })
        .collect()
}

/// cos/sin of `position * freq` for every row, optionally with the frequency
/// vector concatenated with itself.
fn outer_tables(freqs: &[f32], rows: usize, doubled: bool) -> (Tensor, Tensor) {
    let width = if doubled { freqs.len() * 2 } else { freqs.len() };
    let mut cos = Vec::with_capacity(rows * width);
    let mut sin = Vec::with_capacity(rows * width);
    for pos in 0..rows {
        let angles = freqs.iter().map(|f| pos as f32 * f);
        let angles: Vec<f32> = if doubled {
            angles.clone().chain(angles).collect()
        } else {
            angles.collect()
        };
        cos.extend(angles.iter().map(|a| a.cos()));
        sin.extend(angles.iter().map(|a| a.sin()));
    }
    (Tensor::new(cos, [rows, width]), Tensor::new(sin, [rows, width]))
}

/// Rotary embedding component shared by every attention layer.
#[derive(Debug)]
pub struct Rope {
    convention: Box<dyn RotaryConvention>,
    freqs_cos: Tensor,
    freqs_sin: Tensor,
    max_seq_len: usize,
}

impl Rope {
    /// Pick the convention from the config and precompute the tables.
    pub fn new(config: &ModelConfig) -> Rope {
        let convention: Box<dyn RotaryConvention> = if config.use_hf_rope {
            Box::new(HfRotary {
                partial_rotary_factor: config.partial_rotary_factor,
            })
        } else {
            Box::new(NativeRotary {
                use_scaled: config.use_scaled_rope,
                scale_factor: config.rope_scale_factor,
                high_freq_factor: config.high_freq_factor,
            })
        };
        Rope::with_convention(convention, config)
    }

    pub fn with_convention(convention: Box<dyn RotaryConvention>, config: &ModelConfig) -> Rope {
        let rows = config.rope_table_len();
        let (freqs_cos, freqs_sin) =
            convention.precompute(config.head_dim, rows, config.rope_freq_base);
        debug!(
            convention = convention.name(),
            rows,
            width = freqs_cos.dims()[1],
            "precomputed rotary tables"
        );
        Rope {
            convention,
            freqs_cos,
            freqs_sin,
            max_seq_len: config.max_seq_len,
        }
    }

    /// Name of the active convention.
    pub fn convention(&self) -> &str {
        self.convention.name()
    }

    /// Rows `[position, position + seq_len)` of the cos and sin tables.
    ///
    /// Fails when `position` is negative or the window ends past
    /// `max_seq_len` (or past the precomputed table).
    pub fn get_freqs(&self, position: i64, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let limit = self.max_seq_len.min(self.freqs_cos.dims()[0]);
        if position < 0 || position as usize + seq_len > limit {
            return Err(ModelError::RotaryWindow {
                start: position,
                len: seq_len,
                limit,
            });
        }
        let start = position as usize;
        Ok((
            self.freqs_cos.narrow(0, start, seq_len)?,
            self.freqs_sin.narrow(0, start, seq_len)?,
        ))
    }

    /// Rotate `x`, laid out as `[seq_len, n_heads, head_dim]`, in place.
    /// Row `t` of the window rotates every head at sequence index `t`.
    pub fn apply(
        &self,
        x: &mut [f32],
        n_heads: usize,
        head_dim: usize,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<()> {
        let (seq_len, width) = (cos.dims()[0], cos.dims()[1]);
        if x.len() != seq_len * n_heads * head_dim {
            return Err(ModelError::ShapeMismatch {
                what: "rotary input".to_string(),
                expected: vec![seq_len, n_heads, head_dim],
                got: vec![x.len()],
            });
        }
        let cos = cos.as_f32_slice()?;
        let sin = sin.as_f32_slice()?;
        for (t, token) in x.chunks_mut(n_heads * head_dim).enumerate() {
            let c = &cos[t * width..(t + 1) * width];
            let s = &sin[t * width..(t + 1) * width];
            for head in token.chunks_mut(head_dim) {
                self.convention.rotate(head, c, s);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llama::config::ModelArgs;
    use approx::assert_relative_eq;

    fn config(use_hf_rope: bool) -> ModelConfig {
        ModelConfig::from_args(ModelArgs {
            dim: 32,
            n_heads: 4,
            max_seq_len: 20,
            max_context_len: 16,
            use_hf_rope,
            use_scaled_rope: false,
            ..ModelArgs::default()
        })
        .unwrap()
    }

    #[test]
    fn test_native_table_shape() {
        let rope = Rope::new(&config(false));
        assert_eq!(rope.convention(), "native");
        assert_eq!(rope.freqs_cos.dims(), &[16, 4]);
    }

    #[test]
    fn test_hf_table_shape() {
        let rope = Rope::new(&config(true));
        assert_eq!(rope.convention(), "hf");
        assert_eq!(rope.freqs_cos.dims(), &[16, 8]);
        // frequencies repeat across the two halves
        assert_eq!(rope.freqs_sin.get(&[3, 1]).unwrap(), rope.freqs_sin.get(&[3, 5]).unwrap());
    }

    #[test]
    fn test_get_freqs_window() {
        let rope = Rope::new(&config(false));
        let (cos, sin) = rope.get_freqs(5, 4).unwrap();
        assert_eq!(cos.dims(), &[4, 4]);
        assert_eq!(cos.get(&[0, 2]).unwrap(), rope.freqs_cos.get(&[5, 2]).unwrap());
        assert_eq!(sin.get(&[3, 1]).unwrap(), rope.freqs_sin.get(&[8, 1]).unwrap());
    }

    #[test]
    fn test_get_freqs_rejects_bad_windows() {
        let rope = Rope::new(&config(false));
        assert!(matches!(
            rope.get_freqs(-1, 4),
            Err(ModelError::RotaryWindow { .. })
        ));
        // the table has 16 rows even though max_seq_len is 20
        assert!(rope.get_freqs(13, 4).is_err());
        assert!(rope.get_freqs(12, 4).is_ok());
    }

    #[test]
    fn test_position_zero_is_identity() {
        for hf in [false, true] {
            let rope = Rope::new(&config(hf));
            let (cos, sin) = rope.get_freqs(0, 1).unwrap();
            let before: Vec<f32> = (0..16).map(|x| x as f32 * 0.5).collect();
            let mut x = before.clone();
            rope.apply(&mut x, 2, 8, &cos, &sin).unwrap();
            for (a, b) in x.iter().zip(&before) {
                assert_relative_eq!(a, b, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_rotation_preserves_norm() {
        for hf in [false, true] {
            let rope = Rope::new(&config(hf));
            let (cos, sin) = rope.get_freqs(7, 2).unwrap();
            let mut x: Vec<f32> = (0..16).map(|x| (x as f32).sin()).collect();
            let before: f32 = x[..8].iter().map(|v| v * v).sum();
            rope.apply(&mut x, 1, 8, &cos, &sin).unwrap();
            let after: f32 = x[..8].iter().map(|v| v * v).sum();
            assert_relative_eq!(before, after, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_native_rotates_pairs() {
        let rope = NativeRotary {
            use_scaled: false,
            scale_factor: 8.0,
            high_freq_factor: 4.0,
        };
        // quarter turn on the first pair, identity on the second
        let mut x = [1.0, 0.0, 3.0, 4.0];
        rope.rotate(&mut x, &[0.0, 1.0], &[1.0, 0.0]);
        assert_eq!(x, [0.0, 1.0, 3.0, 4.0]);
    }

    #[test]
    fn test_hf_rotates_halves_and_passes_tail() {
        let rope = HfRotary {
            partial_rotary_factor: 0.5,
        };
        assert_eq!(rope.rotary_dim(8), 4);
        let mut x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        // cos 0, sin 1: x1' = -x2, x2' = x1
        rope.rotate(&mut x, &[0.0; 4], &[1.0; 4]);
        assert_eq!(x, [-3.0, -4.0, 1.0, 2.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_scaling_bands() {
        let freqs = [1.0, 2.0 * PI / 10000.0, 2.0 * PI / 4096.0];
        let scaled = scale_freqs(&freqs, 8.0, 4.0);
        // wavelength 2*pi < 2048: untouched
        assert_eq!(scaled[0], 1.0);
        // wavelength 10000 > 8192: divided by the scale factor
        assert_relative_eq!(scaled[1], freqs[1] / 8.0);
        // wavelength 4096 sits in the interpolated band
        assert!(scaled[2] > freqs[2] / 8.0 && scaled[2] < freqs[2]);
    }
}
