//! Error types for the tensor layer.

use thiserror::Error;

use crate::ElementType;

/// Errors that can occur while building, moving or executing tensors.
#[derive(Error, Debug)]
pub enum TensorError {
    /// Element type name or tag has no native mapping.
    #[error("unsupported element type: {0}")]
    UnsupportedType(String),

    /// The allocator could not provide a buffer.
    #[error("allocation of {requested} bytes failed: {reason}")]
    Allocation { requested: usize, reason: String },

    /// Payload length is not a whole number of elements.
    #[error("tensor '{name}' has {byte_length} bytes, not a multiple of {element_size}")]
    Misaligned {
        name: String,
        byte_length: usize,
        element_size: usize,
    },

    /// Tensor exists but carries a different element type.
    #[error("type mismatch for '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: ElementType,
        actual: ElementType,
    },

    /// Tensor exists but its payload size is not the declared one.
    #[error("size mismatch for '{name}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// A required tensor is absent from the set.
    #[error("missing tensor '{0}'")]
    MissingTensor(String),

    /// A tensor name appears twice in one set.
    #[error("duplicate tensor '{0}'")]
    DuplicateTensor(String),

    /// Array shape does not fit the payload.
    #[error("invalid shape: {0}")]
    Shape(String),

    /// The stage executor reported a failure.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Failed to load a model for an executor.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// I/O error when loading model files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TensorError {
    /// Create an allocation error.
    pub fn allocation(requested: usize, reason: impl Into<String>) -> Self {
        Self::Allocation {
            requested,
            reason: reason.into(),
        }
    }

    /// Create an execution failure.
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::ExecutionFailed(reason.into())
    }

    /// True when the error came from an allocator.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::Allocation { .. })
    }
}
