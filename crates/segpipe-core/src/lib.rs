//! Pipelined execution of a model split into segments.
//!
//! This crate provides:
//! - [`PipelinedModelRunner`], one worker thread per segment joined by
//!   bounded FIFO queues, with `push`/`pop` at the ends
//! - [`StageQueue`], the blocking bounded queue with two-phase close
//! - [`PipelineConfig`] for queue capacities, loadable from JSON
//! - [`HostLock`] for releasing an embedding host's lock while blocked
//!
//! Requests that fail inside a segment travel on to `pop` as errors in their
//! original position; later requests are unaffected.

mod config;
mod error;
mod host_lock;
mod plan;
mod queue;
mod runner;
mod stats;
mod worker;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use host_lock::HostLock;
pub use queue::{PopError, PushError, StageQueue};
pub use runner::{PipelinedModelRunner, RunnerBuilder};
pub use stats::SegmentStats;

/// Re-export of the tensor layer.
pub use segpipe_tensor as tensor;
pub use segpipe_tensor::{
    Allocator, ElementType, FnExecutor, StageExecutor, TensorEnvelope, TensorSet, TensorSpec,
};
