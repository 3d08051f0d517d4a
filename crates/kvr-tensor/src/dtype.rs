use std::fmt;

/// Element types a tensor can be stored in.
///
/// Compute always happens in f32; F16 exists so that long-lived buffers
/// (KV caches, attention masks) can be kept at half the footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point (IEEE 754 half-precision, via the `half` crate).
    F16,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
        }
    }
}
