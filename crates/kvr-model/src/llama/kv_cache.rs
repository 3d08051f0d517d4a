//! Key/value cache containers.
//!
//! A cache holds one tensor per layer shaped
//! `[batch, kv_heads, length, head_dim]`. Two physical layouts exist: a list
//! of per-layer tensors, or one layer-major tensor
//! `[n_layers, batch, kv_heads, length, head_dim]`. Which one a session uses
//! is fixed when it is created; the transformer and the cache manager only
//! talk to the [`KvStore`] interface.

use std::fmt::Debug;

use kvr_tensor::{DType, Tensor};

use crate::error::{ModelError, Result};

/// Axis of the sequence/capacity dimension within one layer tensor.
pub const SEQ_AXIS: usize = 2;

/// Physical layout of a multi-layer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayout {
    /// `Vec` of `[batch, kv_heads, len, head_dim]` tensors.
    List,
    /// Single `[n_layers, batch, kv_heads, len, head_dim]` tensor.
    Stacked,
}

impl CacheLayout {
    pub fn from_flag(use_cache_list: bool) -> CacheLayout {
        if use_cache_list {
            CacheLayout::List
        } else {
            CacheLayout::Stacked
        }
    }

    /// Full shape of a cache in this layout. For `List` this is the shape of
    /// each element.
    pub fn cache_shape(&self, n_layers: usize, layer_shape: [usize; 4]) -> Vec<usize> {
        match self {
            CacheLayout::List => layer_shape.to_vec(),
            CacheLayout::Stacked => {
                let mut dims = vec![n_layers];
                dims.extend_from_slice(&layer_shape);
                dims
            }
        }
    }

    /// Allocate a cache filled with zeros.
    pub fn zeros(&self, n_layers: usize, layer_shape: [usize; 4], dtype: DType) -> Box<dyn KvStore> {
        match self {
            CacheLayout::List => Box::new(CacheList {
                layers: (0..n_layers)
                    .map(|_| Tensor::full(layer_shape, 0.0, dtype))
                    .collect(),
                layer_shape: layer_shape.to_vec(),
            }),
            CacheLayout::Stacked => Box::new(StackedCache {
                data: Tensor::full(self.cache_shape(n_layers, layer_shape), 0.0, dtype),
                layer_shape: layer_shape.to_vec(),
            }),
        }
    }

    /// Wrap freshly computed per-layer tensors in this layout.
    pub fn from_layers(&self, layers: Vec<Tensor>) -> Result<Box<dyn KvStore>> {
        let layer_shape = match layers.first() {
            Some(t) => t.dims().to_vec(),
            None => return Err(ModelError::Other("cache needs at least one layer".to_string())),
        };
        if layer_shape.len() != 4 {
            return Err(ModelError::ShapeMismatch {
                what: "cache layer".to_string(),
                expected: vec![0; 4],
                got: layer_shape,
            });
        }
        for t in &layers {
            if t.dims() != layer_shape.as_slice() {
                return Err(ModelError::ShapeMismatch {
                    what: "cache layer".to_string(),
                    expected: layer_shape,
                    got: t.dims().to_vec(),
                });
            }
        }
        match self {
            CacheLayout::List => Ok(Box::new(CacheList {
                layers,
                layer_shape,
            })),
            CacheLayout::Stacked => {
                let refs: Vec<&Tensor> = layers.iter().collect();
                Ok(Box::new(StackedCache {
                    data: Tensor::stack(&refs)?,
                    layer_shape,
                }))
            }
        }
    }
}

/// Access to a multi-layer key or value cache.
pub trait KvStore: Debug + Send + Sync {
    fn layout(&self) -> CacheLayout;

    fn n_layers(&self) -> usize;

    /// `[batch, kv_heads, length, head_dim]` of every layer.
    fn layer_shape(&self) -> &[usize];

    fn dtype(&self) -> DType;

    /// Copy of one layer's tensor.
    fn get(&self, layer: usize) -> Result<Tensor>;

    /// Replace one layer's tensor. The shape must match `layer_shape`.
    fn set(&mut self, layer: usize, value: &Tensor) -> Result<()>;

    /// Copy `len` sequence positions of `src` (a single layer tensor),
    /// starting at `src_start`, into `layer` starting at `dst_start`.
    fn write_span(
        &mut self,
        layer: usize,
        dst_start: usize,
        src: &Tensor,
        src_start: usize,
        len: usize,
    ) -> Result<()>;

    /// Length of the sequence axis.
    fn seq_len(&self) -> usize {
        self.layer_shape()[SEQ_AXIS]
    }
}

fn check_layer(layer: usize, n_layers: usize) -> Result<()> {
    if layer >= n_layers {
        return Err(ModelError::LayerOutOfRange { layer, n_layers });
    }
    Ok(())
}

fn check_shape(what: &str, expected: &[usize], got: &Tensor) -> Result<()> {
    if got.dims() != expected {
        return Err(ModelError::ShapeMismatch {
            what: what.to_string(),
            expected: expected.to_vec(),
            got: got.dims().to_vec(),
        });
    }
    Ok(())
}

/// Cache stored as one tensor per layer.
#[derive(Debug, Clone)]
pub struct CacheList {
    layers: Vec<Tensor>,
    layer_shape: Vec<usize>,
}

impl CacheList {
    pub fn layers(&self) -> &[Tensor] {
        &self.layers
    }
}

impl KvStore for CacheList {
    fn layout(&self) -> CacheLayout {
        CacheLayout::List
    }

    fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn layer_shape(&self) -> &[usize] {
        &self.layer_shape
    }

    fn dtype(&self) -> DType {
        self.layers.first().map(|t| t.dtype()).unwrap_or(DType::F32)
    }

    fn get(&self, layer: usize) -> Result<Tensor> {
        check_layer(layer, self.layers.len())?;
        Ok(self.layers[layer].clone())
    }

    fn set(&mut self, layer: usize, value: &Tensor) -> Result<()> {
        check_layer(layer, self.layers.len())?;
        check_shape("cache layer", &self.layer_shape, value)?;
        let dtype = self.layers[layer].dtype();
        self.layers[layer] = value.to_dtype(dtype);
        Ok(())
    }

    fn write_span(
        &mut self,
        layer: usize,
        dst_start: usize,
        src: &Tensor,
        src_start: usize,
        len: usize,
    ) -> Result<()> {
        check_layer(layer, self.layers.len())?;
        let span = src.narrow(SEQ_AXIS, src_start, len)?;
        self.layers[layer].assign_region(&[0, 0, dst_start, 0], &span)?;
        Ok(())
    }
}

/// Cache stored as a single layer-major tensor.
#[derive(Debug, Clone)]
pub struct StackedCache {
    data: Tensor,
    layer_shape: Vec<usize>,
}

impl StackedCache {
    /// The whole `[n_layers, batch, kv_heads, length, head_dim]` tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.data
    }
}

impl KvStore for StackedCache {
    fn layout(&self) -> CacheLayout {
        CacheLayout::Stacked
    }

    fn n_layers(&self) -> usize {
        self.data.dims()[0]
    }

    fn layer_shape(&self) -> &[usize] {
        &self.layer_shape
    }

    fn dtype(&self) -> DType {
        self.data.dtype()
    }

    fn get(&self, layer: usize) -> Result<Tensor> {
        check_layer(layer, self.n_layers())?;
        Ok(self
            .data
            .narrow(0, layer, 1)?
            .reshape(self.layer_shape.clone())?)
    }

    fn set(&mut self, layer: usize, value: &Tensor) -> Result<()> {
        check_layer(layer, self.n_layers())?;
        check_shape("cache layer", &self.layer_shape, value)?;
        let mut dims = vec![1];
        dims.extend_from_slice(&self.layer_shape);
        self.data.assign_region(&[layer, 0, 0, 0, 0], &value.reshape(dims)?)?;
        Ok(())
    }

    fn write_span(
        &mut self,
        layer: usize,
        dst_start: usize,
        src: &Tensor,
        src_start: usize,
        len: usize,
    ) -> Result<()> {
        check_layer(layer, self.n_layers())?;
        let span = src.narrow(SEQ_AXIS, src_start, len)?;
        let mut dims = vec![1];
        dims.extend_from_slice(span.dims());
        self.data
            .assign_region(&[layer, 0, 0, dst_start, 0], &span.reshape(dims)?)?;
        Ok(())
    }
}
