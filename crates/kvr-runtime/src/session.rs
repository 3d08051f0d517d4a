use std::sync::Arc;

use kvr_model::ModelArchitecture;
use kvr_tensor::{ComputeBackend, Tensor};
use tracing::{debug, info};

use crate::error::{Result, RuntimeError};
use crate::input_manager::{InputManager, InputManagerConfig};

/// One generation sequence: a shared, stateless model plus the cache state
/// this sequence owns.
///
/// Sessions never share an `InputManager`; run one session per sequence.
#[derive(Debug)]
pub struct Session {
    model: Arc<dyn ModelArchitecture>,
    backend: Arc<dyn ComputeBackend>,
    manager: InputManager,
}

impl Session {
    /// Allocate the cache for `model` and check it matches the model's
    /// cache geometry.
    pub fn new(
        model: Arc<dyn ModelArchitecture>,
        backend: Arc<dyn ComputeBackend>,
        config: InputManagerConfig,
    ) -> Result<Session> {
        let mc = model.config();
        if config.use_cache_list != mc.use_cache_list
            || config.n_layers != mc.n_layers
            || config.n_kv_heads != mc.n_kv_heads
            || config.head_dim != mc.head_dim
        {
            return Err(RuntimeError::InvalidConfig(format!(
                "cache geometry (layers {}, kv heads {}, head dim {}, list {}) does not match the model",
                config.n_layers, config.n_kv_heads, config.head_dim, config.use_cache_list
            )));
        }
        let manager = InputManager::new(config)?;
        info!(
            backend = backend.name(),
            cache_size = manager.cache_size(),
            seq_length = manager.seq_length(),
            "session started"
        );
        Ok(Session {
            model,
            backend,
            manager,
        })
    }

    /// Feed `tokens` through the model chunk by chunk, merging each
    /// chunk's keys and values into the cache.
    ///
    /// Returns the logits of the last chunk's final real token.
    pub fn prefill(&mut self, tokens: &[i64]) -> Result<Tensor> {
        let mut remaining = tokens;
        let mut logits = None;
        while !remaining.is_empty() {
            let (out, length, rest) = {
                let (inputs, rest) = self.manager.get_inputs_and_remaining_tokens(remaining)?;
                let out = self
                    .model
                    .forward(&inputs.as_forward_inputs(), self.backend.as_ref())?;
                (out, inputs.input_length as usize, rest)
            };
            self.manager
                .update(length, out.new_k.as_ref(), out.new_v.as_ref())?;
            debug!(
                length,
                input_pos = self.manager.input_pos(),
                cache_pos = self.manager.cache_pos(),
                "chunk done"
            );
            logits = Some(out.logits);
            remaining = rest;
        }
        logits.ok_or(RuntimeError::EmptyInput)
    }

    pub fn manager(&self) -> &InputManager {
        &self.manager
    }

    pub fn model(&self) -> &dyn ModelArchitecture {
        self.model.as_ref()
    }
}
