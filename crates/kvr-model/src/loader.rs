//! Checkpoint load boundary.
//!
//! Deserializing checkpoint files is left to the caller; this module takes
//! an in-memory name → tensor map and copies matching entries into a freshly
//! built [`Transformer`].

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use kvr_tensor::Tensor;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ModelError, Result};
use crate::llama::{ModelArgs, ModelConfig, Parameters, Transformer};

/// Parameter name → tensor.
pub type Checkpoint = HashMap<String, Tensor>;

/// Names that did not line up between a checkpoint and the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Model parameters with no checkpoint entry; they keep their initial
    /// values.
    pub missing: Vec<String>,
    /// Checkpoint entries the model has no parameter for.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Copy every checkpoint entry whose name matches a model parameter.
///
/// Loading is non-strict: missing and unexpected names are reported and
/// logged, not fatal. A matching name with a different shape is an error.
/// Values are converted to the parameter's dtype.
pub fn load_state_dict(model: &mut Transformer, checkpoint: &Checkpoint) -> Result<LoadReport> {
    let mut params = Vec::new();
    model.named_parameters_mut("", &mut params);

    let mut seen = BTreeSet::new();
    let mut missing = Vec::new();
    for (name, param) in params {
        match checkpoint.get(&name) {
            Some(value) => {
                if value.dims() != param.dims() {
                    return Err(ModelError::ShapeMismatch {
                        what: name,
                        expected: param.dims().to_vec(),
                        got: value.dims().to_vec(),
                    });
                }
                *param = value.to_dtype(param.dtype());
                seen.insert(name);
            }
            None => missing.push(name),
        }
    }

    let mut unexpected: Vec<String> = checkpoint
        .keys()
        .filter(|k| !seen.contains(*k))
        .cloned()
        .collect();
    unexpected.sort();

    if !missing.is_empty() {
        warn!(count = missing.len(), keys = ?missing, "missing keys");
    }
    if !unexpected.is_empty() {
        warn!(count = unexpected.len(), keys = ?unexpected, "unexpected keys");
    }
    info!(loaded = seen.len(), "loaded checkpoint");

    Ok(LoadReport {
        missing,
        unexpected,
    })
}

/// Build a model from a checkpoint and a `params.json` document.
///
/// The JSON is overlaid onto defaults. `max_seq_len` and `use_cache_list`
/// from the arguments override the document, and full-logits mode is
/// always off.
pub fn load_model(
    checkpoint: &Checkpoint,
    params: &Value,
    max_seq_len: usize,
    use_cache_list: bool,
) -> Result<(Transformer, LoadReport)> {
    let mut args = ModelArgs::default().overlay(params)?;
    args.max_seq_len = max_seq_len;
    args.use_cache_list = use_cache_list;
    args.generate_full_logits = false;
    let config = ModelConfig::from_args(args)?;

    let mut model = Transformer::new(config);
    let report = load_state_dict(&mut model, checkpoint)?;
    Ok((model, report))
}

/// [`load_model`] with the parameters read from a JSON file.
pub fn load_model_from_file(
    checkpoint: &Checkpoint,
    params_path: impl AsRef<Path>,
    max_seq_len: usize,
    use_cache_list: bool,
) -> Result<(Transformer, LoadReport)> {
    let text = std::fs::read_to_string(params_path)?;
    let params: Value = serde_json::from_str(&text)?;
    load_model(checkpoint, &params, max_seq_len, use_cache_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::ModelArchitecture;
    use kvr_tensor::DType;
    use serde_json::json;
    use std::io::Write;

    fn params() -> Value {
        json!({
            "dim": 8,
            "n_layers": 1,
            "n_heads": 2,
            "vocab_size": 6,
            "hidden_dim": 8,
            "max_seq_len": 999,
            "use_cache_list": true,
            "generate_full_logits": true
        })
    }

    #[test]
    fn test_overrides_win_over_json() {
        let (model, report) = load_model(&Checkpoint::new(), &params(), 32, false).unwrap();
        let config = model.config();
        assert_eq!(config.max_seq_len, 32);
        assert!(!config.use_cache_list);
        assert!(!config.generate_full_logits);
        assert_eq!(config.dim, 8);
        // nothing loaded, everything missing
        assert_eq!(report.missing.len(), 1 + 9 + 2);
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn test_non_strict_load_reports_names() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert(
            "tok_embeddings.weight".to_string(),
            Tensor::full([6, 8], 0.25, DType::F16),
        );
        checkpoint.insert("norm.weight".to_string(), Tensor::full([8], 2.0, DType::F32));
        checkpoint.insert("rope.freqs".to_string(), Tensor::zeros([4]));
        checkpoint.insert("extra.bias".to_string(), Tensor::zeros([1]));

        let (model, report) = load_model(&checkpoint, &params(), 16, true).unwrap();
        assert_eq!(report.unexpected, vec!["extra.bias", "rope.freqs"]);
        assert!(report.missing.contains(&"output.weight".to_string()));
        assert!(!report.missing.contains(&"norm.weight".to_string()));
        assert!(!report.is_complete());

        assert_eq!(model.tok_embeddings.dtype(), DType::F32);
        assert_eq!(model.tok_embeddings.get(&[5, 7]).unwrap(), 0.25);
        assert_eq!(model.norm.weight.get(&[3]).unwrap(), 2.0);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("output.weight".to_string(), Tensor::zeros([8, 6]));
        let err = load_model(&checkpoint, &params(), 16, true).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_load_from_params_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", params()).unwrap();
        let (model, _) = load_model_from_file(&Checkpoint::new(), file.path(), 16, true).unwrap();
        assert_eq!(model.vocab_size(), 6);

        assert!(load_model_from_file(&Checkpoint::new(), "/nonexistent/params.json", 16, true)
            .is_err());
    }
}
