//! Tensor layer for segpipe.
//!
//! This crate provides the pieces a pipeline stage moves around:
//! - [`ElementType`] and the fixed mapping to native types ([`Element`])
//! - [`Buffer`] allocation strategies ([`Allocator`])
//! - [`TensorEnvelope`] and [`TensorSet`], the units of hand-off
//! - [`StageExecutor`], the seam to on-device model execution
//!
//! With the `onnx` feature, [`OrtExecutor`] runs an ONNX model segment as a
//! stage through `ort`.

mod allocator;
mod backend;
mod dtype;
mod error;
mod tensor;

pub use allocator::{
    AllocationReport, Allocator, Buffer, BufferId, FreeStrategy, HeapAllocator,
    TrackingAllocator, TransferAllocator,
};
pub use backend::{FnExecutor, OutputSink, StageExecutor};
pub use dtype::{Element, ElementType};
pub use error::TensorError;
pub use tensor::{TensorEnvelope, TensorSet, TensorSpec};

#[cfg(feature = "onnx")]
pub use backend::ort::{OrtExecutor, OrtInput};

/// Result type for tensor operations.
pub type Result<T> = std::result::Result<T, TensorError>;
