use kvr_model::llama::CacheLayout;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    #[error("chunk of {got} tokens exceeds seq_length {seq_length}")]
    ChunkTooLong { got: usize, seq_length: usize },
    #[error("cache write of {len} positions at {cache_pos} exceeds cache size {cache_size}")]
    CacheOverflow {
        cache_pos: usize,
        len: usize,
        cache_size: usize,
    },
    #[error("{what}: expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("cache layout mismatch: expected {expected:?}, got {got:?}")]
    LayoutMismatch {
        expected: CacheLayout,
        got: CacheLayout,
    },
    #[error("no tokens to process")]
    EmptyInput,
    #[error("model error: {0}")]
    Model(#[from] kvr_model::ModelError),
    #[error("tensor error: {0}")]
    Tensor(#[from] kvr_tensor::TensorError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
