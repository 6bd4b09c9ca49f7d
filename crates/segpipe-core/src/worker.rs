//! Stage worker: one thread per segment.
//!
//! A worker pops one request at a time from its input queue, runs the
//! segment's executor on it and pushes the result downstream. Failures turn
//! into error markers that travel in the request's slot, so ordering holds
//! and later requests are unaffected. When the input queue is closed and
//! drained the worker closes its output queue and exits, which cascades the
//! shutdown down the chain.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use segpipe_tensor::{Allocator, OutputSink, StageExecutor, TensorSet};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::plan::{validate_outputs, StagePlan};
use crate::queue::{PushError, StageQueue};
use crate::stats::SegmentCounters;

/// Why a request failed inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    Executor,
    Allocation,
    InvalidOutput,
    Panic,
}

/// Error marker carried downstream in place of a tensor set.
#[derive(Debug, Clone)]
pub(crate) struct SegmentFailure {
    pub(crate) segment: usize,
    pub(crate) kind: FailureKind,
    pub(crate) message: String,
}

impl From<SegmentFailure> for PipelineError {
    fn from(failure: SegmentFailure) -> Self {
        let SegmentFailure {
            segment,
            kind,
            message,
        } = failure;
        match kind {
            FailureKind::Allocation => PipelineError::Allocation { segment, message },
            FailureKind::InvalidOutput => PipelineError::InvalidOutput { segment, message },
            FailureKind::Executor | FailureKind::Panic => {
                PipelineError::Segment { segment, message }
            }
        }
    }
}

/// One request in flight.
pub(crate) struct Request {
    pub(crate) seq: u64,
    pub(crate) payload: Result<TensorSet, SegmentFailure>,
}

/// Clears the liveness flag when the worker thread ends, however it ends.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) struct StageWorker {
    pub(crate) plan: StagePlan,
    pub(crate) executor: Arc<dyn StageExecutor>,
    pub(crate) input: Arc<StageQueue<Request>>,
    pub(crate) output: Arc<StageQueue<Request>>,
    /// Owns the buffers this segment receives.
    pub(crate) pipeline_allocator: Arc<dyn Allocator>,
    /// Allocates this segment's outputs.
    pub(crate) sink_allocator: Arc<dyn Allocator>,
    pub(crate) counters: Arc<SegmentCounters>,
    pub(crate) alive: Arc<AtomicBool>,
}

impl StageWorker {
    /// Start the worker on a named thread.
    pub(crate) fn spawn(self, name: String) -> std::io::Result<JoinHandle<()>> {
        let alive = Arc::clone(&self.alive);
        alive.store(true, Ordering::Release);

        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .inspect_err(|_| alive.store(false, Ordering::Release))
    }

    fn run(self) {
        let _alive = AliveGuard(Arc::clone(&self.alive));
        let segment = self.plan.index;
        info!("Segment {} worker started", segment);

        while let Some(Request { seq, payload }) = self.input.pop() {
            let payload = match payload {
                Ok(set) => self.process(seq, set),
                Err(failure) => {
                    debug!(
                        "Segment {} forwarding failure of request {} from segment {}",
                        segment, seq, failure.segment
                    );
                    Err(failure)
                }
            };

            if let Err(PushError::Closed(rejected) | PushError::Full(rejected)) =
                self.output.push(Request { seq, payload })
            {
                warn!(
                    "Segment {} output queue closed, dropping request {}",
                    segment, rejected.seq
                );
                if let Ok(set) = rejected.payload {
                    set.free(self.sink_allocator.as_ref());
                }
            }
        }

        self.output.close();
        info!("Segment {} worker exiting", segment);
    }

    fn process(&self, seq: u64, set: TensorSet) -> Result<TensorSet, SegmentFailure> {
        let segment = self.plan.index;
        debug!("Segment {} invoking on request {}", segment, seq);

        let mut sink = OutputSink::new(self.sink_allocator.as_ref());
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.executor.invoke(&set, &mut sink)
        }));
        let elapsed = started.elapsed();

        let checked = match outcome {
            Ok(Ok(())) => validate_outputs(sink.produced(), self.executor.output_specs())
                .map_err(|message| self.failure(FailureKind::InvalidOutput, message)),
            Ok(Err(e)) if e.is_allocation() => {
                Err(self.failure(FailureKind::Allocation, e.to_string()))
            }
            Ok(Err(e)) => Err(self.failure(FailureKind::Executor, e.to_string())),
            Err(cause) => Err(self.failure(FailureKind::Panic, panic_message(cause.as_ref()))),
        };
        self.counters.record(elapsed, checked.is_err());

        if let Err(failure) = checked {
            warn!(
                "Segment {} failed on request {}: {}",
                segment, seq, failure.message
            );
            sink.discard();
            set.free(self.pipeline_allocator.as_ref());
            return Err(failure);
        }

        let produced = sink.finish();
        debug!(
            "Segment {} produced {} tensors ({} bytes) for request {} in {:?}",
            segment,
            produced.len(),
            produced.byte_length(),
            seq,
            elapsed
        );

        Ok(self.carry_forward(set, produced))
    }

    /// Keep what later segments read, free the rest.
    fn carry_forward(&self, set: TensorSet, produced: TensorSet) -> TensorSet {
        let retain = &self.plan.retain;

        let (mut carried, consumed) = set.partition(|t| retain.contains(t.name()));
        consumed.free(self.pipeline_allocator.as_ref());

        let (kept, unused) = if self.plan.is_last {
            (produced, TensorSet::new())
        } else {
            produced.partition(|t| retain.contains(t.name()))
        };
        unused.free(self.sink_allocator.as_ref());

        for tensor in kept {
            if let Err(rejected) = carried.try_insert(tensor) {
                warn!(
                    "Segment {} output '{}' shadows a carried tensor, dropping it",
                    self.plan.index,
                    rejected.name()
                );
                rejected.free(self.sink_allocator.as_ref());
            }
        }

        carried
    }

    fn failure(&self, kind: FailureKind, message: String) -> SegmentFailure {
        SegmentFailure {
            segment: self.plan.index,
            kind,
            message,
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        format!("executor panicked: {}", message)
    } else if let Some(message) = cause.downcast_ref::<String>() {
        format!("executor panicked: {}", message)
    } else {
        "executor panicked".to_string()
    }
}
