use std::fmt;

// DType — Supported element formats
//
// Every managed tensor carries a format tag that determines its byte
// footprint. The memory planner packs by bytes, so the tag matters even
// though the reference CPU storage holds f32 values (half-precision
// tensors are widened on the host, the same convention the GPU offload
// path uses when no half kernels are available).

/// Element format tag carried by every managed tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    /// 16-bit IEEE half float, for mixed-precision training.
    F16,
    /// 32-bit float, the default workhorse.
    #[default]
    F32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
        }
    }

    /// Whether this is a half-precision format.
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
        };
        write!(f, "{}", s)
    }
}
