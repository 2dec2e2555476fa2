use crate::shape::TensorDim;

/// All errors that can occur within Marten.
///
/// This enum captures every failure mode of graph compilation, tensor
/// lifetime management, and execution. Using a single error type across
/// the workspace simplifies error propagation.
///
/// Every structured variant names the node or tensor that violated its
/// precondition, so a failed compile points at the offending layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A node or tensor was registered twice under the same name.
    #[error("duplicate name: '{0}' already exists")]
    DuplicateName(String),

    /// Lookup by an unknown name or index.
    #[error("not found: {0}")]
    NotFound(String),

    /// The dependency edges admit no linear extension.
    #[error("dependency cycle detected involving: {0}")]
    Cycle(String),

    /// Malformed graph structure: dangling reference, ambiguous
    /// input/label detection, non-compilable node set.
    #[error("invalid parameter at node '{node}': {reason}")]
    InvalidParameter { node: String, reason: String },

    /// A layer rejected its resolved input shapes.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: TensorDim, got: TensorDim },

    /// A layer rejected its configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The compute-offload context could not be acquired.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Marten.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
