//! Error types for the segpipe-core library.

use thiserror::Error;

/// Main error type for the pipeline runner.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid runner configuration or segment chain.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pushed tensor set does not match the first segment's inputs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An allocator could not provide memory for a request.
    #[error("segment {segment} allocation failed: {message}")]
    Allocation { segment: usize, message: String },

    /// A segment's executor failed on this request.
    #[error("segment {segment} runner error: {message}")]
    Segment { segment: usize, message: String },

    /// A segment returned outputs that do not match its declaration.
    #[error("segment {segment} produced invalid output: {message}")]
    InvalidOutput { segment: usize, message: String },

    /// The pipeline no longer accepts input.
    #[error("pipeline was turned off before")]
    Closed,

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),

    /// Tensor layer error.
    #[error("tensor error: {0}")]
    Tensor(#[from] segpipe_tensor::TensorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for the segpipe-core library.
pub type Result<T> = std::result::Result<T, PipelineError>;
