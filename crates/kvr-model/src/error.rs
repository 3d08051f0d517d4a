use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("exactly one of tokens or embedding must be given (tokens: {tokens}, embedding: {embedding})")]
    InputConflict { tokens: bool, embedding: bool },
    #[error("rotary window {start}..{start}+{len} outside 0..{limit}")]
    RotaryWindow { start: i64, len: usize, limit: usize },
    #[error("token id {id} outside vocabulary of {vocab_size}")]
    TokenOutOfRange { id: i64, vocab_size: usize },
    #[error("{what}: expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("layer {layer} out of range for {n_layers} layers")]
    LayerOutOfRange { layer: usize, n_layers: usize },
    #[error("cache layout mismatch: model expects {expected:?}, got {got:?}")]
    LayoutMismatch {
        expected: crate::llama::CacheLayout,
        got: crate::llama::CacheLayout,
    },
    #[error("input_length {input_length} outside 1..={seq_len}")]
    InvalidInputLength { input_length: i64, seq_len: usize },
    #[error("tensor error: {0}")]
    TensorError(#[from] kvr_tensor::TensorError),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
