use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: String, got: String },
    #[error("invalid axis {axis} for tensor with {ndim} dimensions")]
    InvalidAxis { axis: usize, ndim: usize },
    #[error("range {start}..{end} out of bounds for axis {axis} of size {size}")]
    OutOfRange {
        axis: usize,
        start: usize,
        end: usize,
        size: usize,
    },
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;
