//! Pipelined model runner.
//!
//! ```text
//!  push ──▶ [input q] ──▶ segment 0 ──▶ [q 1] ──▶ segment 1 ──▶ … ──▶ [output q] ──▶ pop
//! ```
//!
//! Every queue is bounded, so a slow segment stalls the ones before it and,
//! eventually, the caller's `push`. With exactly one worker per segment and
//! FIFO queues, results come out in push order.
//!
//! ```no_run
//! use std::sync::Arc;
//! use segpipe_core::PipelinedModelRunner;
//! use segpipe_core::tensor::{FnExecutor, StageExecutor, TensorEnvelope, TensorSet};
//!
//! # fn main() -> segpipe_core::Result<()> {
//! let double: Arc<dyn StageExecutor> =
//!     Arc::new(FnExecutor::map::<f32, _>("input", "output", |x| x * 2.0));
//! let runner = PipelinedModelRunner::new(vec![double])?;
//!
//! let input = TensorEnvelope::from_slice(
//!     "input",
//!     &[1.0f32, 2.0, 3.0, 4.0],
//!     runner.input_allocator().as_ref(),
//! )?;
//! runner.push(TensorSet::from_tensors(vec![input])?)?;
//! runner.close();
//!
//! while let Some(result) = runner.pop()? {
//!     println!("{:?}", result.require("output")?.to_vec::<f32>()?);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use segpipe_tensor::{
    Allocator, Buffer, FreeStrategy, HeapAllocator, StageExecutor, TensorEnvelope, TensorSet,
    TensorSpec, TransferAllocator,
};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::host_lock::{HostLock, ReleasedHostLock};
use crate::plan::{plan_segments, validate_inputs};
use crate::queue::StageQueue;
use crate::stats::{SegmentCounters, SegmentStats};
use crate::worker::{Request, StageWorker};

/// Builder for [`PipelinedModelRunner`].
pub struct RunnerBuilder {
    executors: Vec<Arc<dyn StageExecutor>>,
    config: PipelineConfig,
    input_allocator: Option<Arc<dyn Allocator>>,
    output_allocator: Option<Arc<dyn Allocator>>,
    host_lock: Option<Arc<dyn HostLock>>,
}

impl RunnerBuilder {
    /// Queue capacities and thread naming.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Allocator for pushed inputs and intermediate tensors.
    ///
    /// Defaults to a [`HeapAllocator`].
    pub fn input_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.input_allocator = Some(allocator);
        self
    }

    /// Allocator for the last segment's outputs.
    ///
    /// Must use [`FreeStrategy::Transfer`]: popping a result frees its
    /// buffers here and hands the memory to the caller. Defaults to a
    /// [`TransferAllocator`].
    pub fn output_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.output_allocator = Some(allocator);
        self
    }

    /// Lock to release while `push` or `pop` block.
    pub fn host_lock(mut self, lock: Arc<dyn HostLock>) -> Self {
        self.host_lock = Some(lock);
        self
    }

    /// Validate the segment chain and start one worker per segment.
    pub fn build(self) -> Result<PipelinedModelRunner> {
        self.config.validate()?;
        let plans = plan_segments(&self.executors)?;

        let input_allocator = self
            .input_allocator
            .unwrap_or_else(|| Arc::new(HeapAllocator::new()));
        let output_allocator = self
            .output_allocator
            .unwrap_or_else(|| Arc::new(TransferAllocator::new()));
        if output_allocator.strategy() != FreeStrategy::Transfer {
            return Err(PipelineError::Config(
                "output allocator must transfer ownership on free".into(),
            ));
        }

        let segments = self.executors.len();
        let mut queues = Vec::with_capacity(segments + 1);
        queues.push(Arc::new(StageQueue::new(self.config.input_capacity(segments))));
        for _ in 1..segments {
            queues.push(Arc::new(StageQueue::new(
                self.config.intermediate_capacity(segments),
            )));
        }
        queues.push(Arc::new(StageQueue::new(self.config.output_capacity(segments))));

        let counters: Vec<Arc<SegmentCounters>> = (0..segments)
            .map(|_| Arc::new(SegmentCounters::default()))
            .collect();
        let alive: Vec<Arc<AtomicBool>> = (0..segments)
            .map(|_| Arc::new(AtomicBool::new(false)))
            .collect();

        let mut workers = Vec::with_capacity(segments);
        for (index, plan) in plans.into_iter().enumerate() {
            let sink_allocator = if plan.is_last {
                Arc::clone(&output_allocator)
            } else {
                Arc::clone(&input_allocator)
            };
            let worker = StageWorker {
                plan,
                executor: Arc::clone(&self.executors[index]),
                input: Arc::clone(&queues[index]),
                output: Arc::clone(&queues[index + 1]),
                pipeline_allocator: Arc::clone(&input_allocator),
                sink_allocator,
                counters: Arc::clone(&counters[index]),
                alive: Arc::clone(&alive[index]),
            };

            let name = format!("{}-{}", self.config.thread_name_prefix, index);
            match worker.spawn(name) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    warn!("Failed to spawn worker for segment {}: {}", index, e);
                    queues[0].close();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(PipelineError::Spawn(e));
                }
            }
        }

        info!(
            "Pipeline started with {} segments (input capacity {}, output capacity {})",
            segments,
            queues[0].capacity(),
            queues[segments].capacity()
        );

        Ok(PipelinedModelRunner {
            executors: self.executors,
            queues,
            workers: Mutex::new(workers),
            alive,
            counters,
            input_allocator,
            output_allocator,
            host_lock: self.host_lock,
            started: Mutex::new(false),
            next_seq: AtomicU64::new(0),
        })
    }
}

/// Runs a chain of model segments, one worker thread per segment.
///
/// `push` and `pop` may be called from different threads; the runner is
/// `Send + Sync` and is usually shared through an `Arc`.
pub struct PipelinedModelRunner {
    executors: Vec<Arc<dyn StageExecutor>>,
    /// `queues[0]` feeds segment 0, `queues[n]` holds results.
    queues: Vec<Arc<StageQueue<Request>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    alive: Vec<Arc<AtomicBool>>,
    counters: Vec<Arc<SegmentCounters>>,
    input_allocator: Arc<dyn Allocator>,
    output_allocator: Arc<dyn Allocator>,
    host_lock: Option<Arc<dyn HostLock>>,
    /// Set by the first push. Capacity changes check and apply under this
    /// lock, so none lands once a request has been enqueued.
    started: Mutex<bool>,
    next_seq: AtomicU64,
}

impl PipelinedModelRunner {
    /// Start a runner with default configuration and allocators.
    pub fn new(executors: Vec<Arc<dyn StageExecutor>>) -> Result<Self> {
        Self::builder(executors).build()
    }

    /// Configure a runner over the given segments, in execution order.
    pub fn builder(executors: Vec<Arc<dyn StageExecutor>>) -> RunnerBuilder {
        RunnerBuilder {
            executors,
            config: PipelineConfig::default(),
            input_allocator: None,
            output_allocator: None,
            host_lock: None,
        }
    }

    /// Set the capacity of the queue feeding the first segment.
    ///
    /// Only allowed before the first `push`.
    pub fn set_input_queue_capacity(&self, capacity: usize) -> Result<()> {
        self.set_capacity(0, "input", capacity)
    }

    /// Set the capacity of the queue holding unconsumed results.
    ///
    /// Only allowed before the first `push`.
    pub fn set_output_queue_capacity(&self, capacity: usize) -> Result<()> {
        self.set_capacity(self.queues.len() - 1, "output", capacity)
    }

    fn set_capacity(&self, queue: usize, which: &str, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(PipelineError::Config(format!(
                "{} queue capacity must be non-zero",
                which
            )));
        }
        let started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if *started {
            return Err(PipelineError::Config(format!(
                "cannot change {} queue capacity after the first push",
                which
            )));
        }
        debug!("Setting {} queue capacity to {}", which, capacity);
        self.queues[queue].set_capacity(capacity);
        Ok(())
    }

    /// Submit one request.
    ///
    /// Blocks while the input queue is full. An empty set is the
    /// end-of-input signal, same as [`close`](Self::close). Buffers must come
    /// from [`input_allocator`](Self::input_allocator); on error they are
    /// freed.
    pub fn push(&self, tensors: TensorSet) -> Result<()> {
        let input = &self.queues[0];

        if tensors.is_empty() {
            if input.is_closed() {
                return Err(PipelineError::Closed);
            }
            self.close();
            return Ok(());
        }

        if input.is_closed() {
            tensors.free(self.input_allocator.as_ref());
            return Err(PipelineError::Closed);
        }

        if let Err(e) = validate_inputs(&tensors, self.executors[0].input_specs()) {
            tensors.free(self.input_allocator.as_ref());
            return Err(e);
        }

        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = true;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!("Pushing request {} ({} bytes)", seq, tensors.byte_length());

        let pushed = {
            let _released = ReleasedHostLock::new(self.host_lock.as_deref());
            input.push(Request {
                seq,
                payload: Ok(tensors),
            })
        };

        pushed.map_err(|rejected| {
            if let Ok(tensors) = rejected.into_inner().payload {
                tensors.free(self.input_allocator.as_ref());
            }
            PipelineError::Closed
        })
    }

    /// Take the next result, blocking until one is ready.
    ///
    /// Returns `Ok(None)` once input is closed and every segment has drained.
    /// A request that failed in a segment comes back as that segment's error,
    /// in its original position.
    pub fn pop(&self) -> Result<Option<TensorSet>> {
        let output = &self.queues[self.queues.len() - 1];

        let request = {
            let _released = ReleasedHostLock::new(self.host_lock.as_deref());
            output.pop()
        };

        let Some(Request { seq, payload }) = request else {
            debug!("Pipeline drained, no more results");
            return Ok(None);
        };

        match payload {
            Ok(tensors) => {
                debug!("Popped request {}", seq);
                self.detach(tensors).map(Some)
            }
            Err(failure) => {
                debug!("Popped failed request {}", seq);
                Err(failure.into())
            }
        }
    }

    /// Move result buffers out of the output allocator into caller memory.
    fn detach(&self, tensors: TensorSet) -> Result<TensorSet> {
        let mut detached = TensorSet::with_capacity(tensors.len());
        let mut remaining = tensors.into_iter();

        while let Some(tensor) = remaining.next() {
            let (name, dtype, buffer) = tensor.into_parts();
            let Some(bytes) = self.output_allocator.free(buffer) else {
                for rest in remaining {
                    rest.free(self.output_allocator.as_ref());
                }
                return Err(PipelineError::Allocation {
                    segment: self.executors.len() - 1,
                    message: format!("output allocator released the payload of '{}'", name),
                });
            };
            detached.insert(TensorEnvelope::new(name, dtype, Buffer::detached(bytes))?)?;
        }

        Ok(detached)
    }

    /// Stop accepting input. In-flight requests still drain to `pop`.
    pub fn close(&self) {
        if !self.queues[0].is_closed() {
            info!("Closing pipeline input");
        }
        self.queues[0].close();
    }

    /// Close input, wait for every segment to drain and join the workers.
    ///
    /// Results nobody popped are freed; their count is returned.
    pub fn shutdown(&self) -> usize {
        self.close();

        let output = &self.queues[self.queues.len() - 1];
        let mut unconsumed = 0;
        while let Some(request) = output.pop() {
            unconsumed += 1;
            if let Ok(tensors) = request.payload {
                tensors.free(self.output_allocator.as_ref());
            }
        }

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (index, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!("Segment {} worker terminated abnormally", index);
            }
        }

        info!("Pipeline shut down");
        unconsumed
    }

    /// Number of segments.
    pub fn num_segments(&self) -> usize {
        self.executors.len()
    }

    /// The segments, in execution order.
    pub fn executors(&self) -> &[Arc<dyn StageExecutor>] {
        &self.executors
    }

    /// Tensors every pushed set must contain.
    pub fn input_specs(&self) -> &[TensorSpec] {
        self.executors[0].input_specs()
    }

    /// Tensors every popped set contains.
    pub fn output_specs(&self) -> &[TensorSpec] {
        self.executors[self.executors.len() - 1].output_specs()
    }

    /// Allocator to build pushed tensors with.
    pub fn input_allocator(&self) -> &Arc<dyn Allocator> {
        &self.input_allocator
    }

    /// Allocator the last segment writes results with.
    pub fn output_allocator(&self) -> &Arc<dyn Allocator> {
        &self.output_allocator
    }

    /// Per-segment counters, in execution order.
    pub fn segment_stats(&self) -> Vec<SegmentStats> {
        self.counters.iter().map(|c| c.snapshot()).collect()
    }

    /// Number of worker threads still running.
    pub fn live_workers(&self) -> usize {
        self.alive
            .iter()
            .filter(|a| a.load(Ordering::Acquire))
            .count()
    }

    /// Items currently waiting in each queue, input first.
    pub fn queue_depths(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.len()).collect()
    }

    /// Capacity of each queue, input first.
    pub fn queue_capacities(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.capacity()).collect()
    }

    /// Largest depth each queue has reached, input first.
    pub fn queue_high_water_marks(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.high_water_mark()).collect()
    }
}

impl Drop for PipelinedModelRunner {
    fn drop(&mut self) {
        let joined = self
            .workers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        if joined {
            return;
        }

        let unconsumed = self.shutdown();
        if unconsumed > 0 {
            warn!(
                "{} unconsumed results in the pipeline during destruction",
                unconsumed
            );
        }
    }
}
