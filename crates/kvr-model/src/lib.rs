pub mod architecture;
pub mod error;
pub mod llama;
pub mod loader;

pub use architecture::{ForwardInputs, ForwardOutput, ModelArchitecture};
pub use error::{ModelError, Result};
pub use loader::{load_model, load_state_dict, Checkpoint, LoadReport};
