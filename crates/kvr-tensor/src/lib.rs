//! `kvr-tensor` - Dense CPU tensors and compute backends for the kvring runtime.
//!
//! This crate provides:
//! - A `Tensor` type backed by CPU storage (f32 or f16)
//! - Structural ops the decoder and cache manager need: narrow, cat, stack,
//!   transpose, repeat_interleave and in-place region assignment
//! - A `ComputeBackend` trait for the numeric kernels, with a reference
//!   `CpuBackend` implementation

pub mod backend;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod storage;
pub mod tensor;

// Re-export primary types at the crate root for convenience.
pub use backend::ComputeBackend;
pub use cpu::CpuBackend;
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use shape::Shape;
pub use storage::CpuStorage;
pub use tensor::Tensor;
