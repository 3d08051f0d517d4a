//! `kvr-runtime` - Host-side cache management for the kvring decoder.
//!
//! - `InputManager` owns the circular KV cache and the attention mask and
//!   slices token streams into fixed-length chunks.
//! - `Session` drives a model over a prompt, chunk by chunk.

pub mod error;
pub mod input_manager;
pub mod session;

pub use error::{Result, RuntimeError};
pub use input_manager::{InputManager, InputManagerConfig, ModelInputs};
pub use session::Session;
