use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, Result};

/// Raw model arguments as they appear in a `params.json`.
///
/// Every field has a default, so a JSON object only needs the keys it wants
/// to override. Optional fields are resolved into concrete values by
/// [`ModelConfig::from_args`]; unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: Option<usize>,
    pub vocab_size: usize,
    pub hidden_dim: Option<usize>,
    /// Overrides `dim / n_heads` when set.
    pub head_dim: Option<usize>,
    pub multiple_of: usize,
    pub ffn_dim_multiplier: Option<f32>,
    pub norm_eps: f32,
    pub max_batch_size: usize,
    pub max_seq_len: usize,
    pub max_context_len: usize,
    pub moe: bool,
    pub num_experts: usize,
    /// Carried through from params files; routing always picks the top two.
    pub num_activated_experts: usize,
    /// Emit logits for every position of the chunk instead of only the last
    /// real token. Large at runtime; only for perplexity-style tooling.
    pub generate_full_logits: bool,
    pub use_hf_rope: bool,
    /// Official name for the rotary base; wins over `rope_freq_base`.
    pub rope_theta: Option<f32>,
    pub rope_freq_base: f32,
    pub use_scaled_rope: bool,
    pub rope_scale_factor: f32,
    pub high_freq_factor: f32,
    pub partial_rotary_factor: f32,
    pub use_cache_list: bool,
    pub use_qk_norm: bool,
    pub qk_norm_before_rope: bool,
}

impl Default for ModelArgs {
    fn default() -> Self {
        ModelArgs {
            dim: 2048,
            n_layers: 16,
            n_heads: 32,
            n_kv_heads: None,
            vocab_size: 128256,
            hidden_dim: None,
            head_dim: None,
            multiple_of: 256,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            max_batch_size: 1,
            max_seq_len: 128,
            max_context_len: 2048,
            moe: false,
            num_experts: 8,
            num_activated_experts: 2,
            generate_full_logits: false,
            use_hf_rope: false,
            rope_theta: None,
            rope_freq_base: 10000.0,
            use_scaled_rope: true,
            rope_scale_factor: 8.0,
            high_freq_factor: 4.0,
            partial_rotary_factor: 1.0,
            use_cache_list: true,
            use_qk_norm: false,
            qk_norm_before_rope: false,
        }
    }
}

impl ModelArgs {
    /// Parse arguments from a JSON document, filling absent keys with defaults.
    pub fn from_json_str(json: &str) -> Result<ModelArgs> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a `params.json` file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<ModelArgs> {
        let text = std::fs::read_to_string(path)?;
        ModelArgs::from_json_str(&text)
    }

    /// Overlay the keys of a JSON object onto these arguments.
    ///
    /// Keys absent from `patch` keep their current value.
    pub fn overlay(&self, patch: &Value) -> Result<ModelArgs> {
        let patch = patch.as_object().ok_or_else(|| {
            ModelError::InvalidConfig("model params must be a JSON object".to_string())
        })?;
        let mut base = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut base {
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::from_value(base)?)
    }
}

/// Resolved, validated model configuration.
///
/// Derived fields (`n_kv_heads`, `hidden_dim`, `head_dim`, the rotary base)
/// are computed once here and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    /// Embedding dimension / hidden size.
    pub dim: usize,
    /// Number of transformer layers.
    pub n_layers: usize,
    /// Number of attention heads for queries.
    pub n_heads: usize,
    /// Number of attention heads for keys/values (GQA).
    pub n_kv_heads: usize,
    /// Vocabulary size (number of token embeddings).
    pub vocab_size: usize,
    /// Feed-forward intermediate dimension.
    pub hidden_dim: usize,
    /// Dimension of each attention head.
    pub head_dim: usize,
    pub multiple_of: usize,
    pub ffn_dim_multiplier: Option<f32>,
    /// RMS normalization epsilon.
    pub norm_eps: f32,
    pub max_batch_size: usize,
    /// Upper bound on `input_pos + chunk_length` accepted by the rotary lookup.
    pub max_seq_len: usize,
    pub max_context_len: usize,
    pub moe: bool,
    pub num_experts: usize,
    pub num_activated_experts: usize,
    pub generate_full_logits: bool,
    pub use_hf_rope: bool,
    /// RoPE frequency base (theta).
    pub rope_freq_base: f32,
    pub use_scaled_rope: bool,
    pub rope_scale_factor: f32,
    pub high_freq_factor: f32,
    pub partial_rotary_factor: f32,
    pub use_cache_list: bool,
    pub use_qk_norm: bool,
    pub qk_norm_before_rope: bool,
}

impl ModelConfig {
    /// Resolve and validate raw arguments.
    pub fn from_args(args: ModelArgs) -> Result<ModelConfig> {
        if args.dim == 0 || args.n_layers == 0 || args.vocab_size == 0 {
            return Err(ModelError::InvalidConfig(
                "dim, n_layers and vocab_size must be > 0".to_string(),
            ));
        }
        if args.n_heads == 0 {
            return Err(ModelError::InvalidConfig("n_heads must be > 0".to_string()));
        }

        let n_kv_heads = args.n_kv_heads.unwrap_or(args.n_heads);
        if n_kv_heads == 0 || args.n_heads % n_kv_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "n_heads ({}) must be a multiple of n_kv_heads ({})",
                args.n_heads, n_kv_heads
            )));
        }

        let head_dim = args.head_dim.unwrap_or(args.dim / args.n_heads);
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "head_dim must be even and > 0, got {}",
                head_dim
            )));
        }

        let hidden_dim = match args.hidden_dim {
            Some(h) => h,
            None => {
                if args.multiple_of == 0 {
                    return Err(ModelError::InvalidConfig(
                        "multiple_of must be > 0".to_string(),
                    ));
                }
                let mut hidden = 2 * (4 * args.dim) / 3;
                if let Some(multiplier) = args.ffn_dim_multiplier {
                    hidden = (multiplier * hidden as f32) as usize;
                }
                find_multiple(hidden, args.multiple_of)
            }
        };

        Ok(ModelConfig {
            dim: args.dim,
            n_layers: args.n_layers,
            n_heads: args.n_heads,
            n_kv_heads,
            vocab_size: args.vocab_size,
            hidden_dim,
            head_dim,
            multiple_of: args.multiple_of,
            ffn_dim_multiplier: args.ffn_dim_multiplier,
            norm_eps: args.norm_eps,
            max_batch_size: args.max_batch_size,
            max_seq_len: args.max_seq_len,
            max_context_len: args.max_context_len,
            moe: args.moe,
            num_experts: args.num_experts,
            num_activated_experts: args.num_activated_experts,
            generate_full_logits: args.generate_full_logits,
            use_hf_rope: args.use_hf_rope,
            rope_freq_base: args.rope_theta.unwrap_or(args.rope_freq_base),
            use_scaled_rope: args.use_scaled_rope,
            rope_scale_factor: args.rope_scale_factor,
            high_freq_factor: args.high_freq_factor,
            partial_rotary_factor: args.partial_rotary_factor,
            use_cache_list: args.use_cache_list,
            use_qk_norm: args.use_qk_norm,
            qk_norm_before_rope: args.qk_norm_before_rope,
        })
    }

    /// Parse and resolve a JSON document in one step.
    pub fn from_json_str(json: &str) -> Result<ModelConfig> {
        ModelConfig::from_args(ModelArgs::from_json_str(json)?)
    }

    /// How many query heads share each key/value head.
    pub fn n_rep(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Number of rows in the precomputed rotary tables.
    ///
    /// Checkpoints that carry `ffn_dim_multiplier` were exported with twice
    /// the context, so their tables are doubled as well.
    pub fn rope_table_len(&self) -> usize {
        if self.ffn_dim_multiplier.is_some() {
            self.max_context_len * 2
        } else {
            self.max_context_len
        }
    }
}

/// Round `n` up to the next multiple of `k`.
pub fn find_multiple(n: usize, k: usize) -> usize {
    if n % k == 0 {
        return n;
    }
    n + k - (n % k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_defaults_resolve() {
        let cfg = ModelConfig::from_args(ModelArgs::default()).unwrap();
        assert_eq!(cfg.n_kv_heads, 32);
        assert_eq!(cfg.head_dim, 64);
        // 2 * 4 * 2048 / 3 = 5461, rounded up to a multiple of 256
        assert_eq!(cfg.hidden_dim, 5632);
        assert_eq!(cfg.rope_freq_base, 10000.0);
        assert_eq!(cfg.rope_table_len(), 2048);
    }

    #[test]
    fn test_find_multiple() {
        assert_eq!(find_multiple(256, 256), 256);
        assert_eq!(find_multiple(257, 256), 512);
        assert_eq!(find_multiple(1, 8), 8);
    }

    #[test]
    fn test_json_overlay_and_rope_theta() {
        let cfg = ModelConfig::from_json_str(
            r#"{"dim": 64, "n_heads": 8, "n_kv_heads": 2, "rope_theta": 500000.0,
                "ffn_dim_multiplier": 1.5, "multiple_of": 32, "unknown_key": 1}"#,
        )
        .unwrap();
        assert_eq!(cfg.n_rep(), 4);
        assert_eq!(cfg.head_dim, 8);
        assert_eq!(cfg.rope_freq_base, 500000.0);
        // 2 * 256 / 3 = 170, * 1.5 = 255, rounded up to 256
        assert_eq!(cfg.hidden_dim, 256);
        assert_eq!(cfg.rope_table_len(), 4096);
        // untouched keys keep defaults
        assert_eq!(cfg.n_layers, 16);
        assert!(cfg.use_cache_list);
    }

    #[test]
    fn test_overlay_keeps_base_values() {
        let base = ModelArgs {
            max_seq_len: 512,
            ..ModelArgs::default()
        };
        let args = base.overlay(&json!({"n_layers": 2, "moe": true})).unwrap();
        assert_eq!(args.max_seq_len, 512);
        assert_eq!(args.n_layers, 2);
        assert!(args.moe);
        assert!(base.overlay(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_explicit_head_dim() {
        let cfg = ModelConfig::from_json_str(r#"{"dim": 64, "n_heads": 4, "head_dim": 32}"#)
            .unwrap();
        assert_eq!(cfg.head_dim, 32);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let err = ModelConfig::from_json_str(r#"{"n_heads": 8, "n_kv_heads": 3}"#);
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_num_activated_experts_is_kept_as_given() {
        let config = ModelConfig::from_json_str(
            r#"{"moe": true, "num_experts": 2, "num_activated_experts": 3}"#,
        )
        .unwrap();
        assert_eq!(config.num_activated_experts, 3);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"dim": 32, "n_heads": 4, "vocab_size": 100}}"#).unwrap();
        let args = ModelArgs::from_json_file(file.path()).unwrap();
        assert_eq!(args.dim, 32);
        assert_eq!(args.vocab_size, 100);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ModelArgs::from_json_str("{not json"),
            Err(ModelError::Json(_))
        ));
    }
}
