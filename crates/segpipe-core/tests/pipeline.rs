use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use segpipe_core::tensor::{
    ElementType, FnExecutor, StageExecutor, TensorEnvelope, TensorError, TensorSet, TensorSpec,
    TrackingAllocator, TransferAllocator,
};
use segpipe_core::{HostLock, PipelineConfig, PipelineError, PipelinedModelRunner};

fn map_stage(input: &str, output: &str, f: fn(f32) -> f32) -> Arc<dyn StageExecutor> {
    Arc::new(FnExecutor::map::<f32, _>(input, output, f))
}

fn request(runner: &PipelinedModelRunner, name: &str, values: &[f32]) -> TensorSet {
    let tensor =
        TensorEnvelope::from_slice(name, values, runner.input_allocator().as_ref()).unwrap();
    TensorSet::from_tensors(vec![tensor]).unwrap()
}

fn values(result: &TensorSet, name: &str) -> Vec<f32> {
    result.require(name).unwrap().to_vec::<f32>().unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_round_trip_doubles_input() {
    let runner = PipelinedModelRunner::new(vec![map_stage("input", "output", |x| x * 2.0)]).unwrap();

    runner.push(request(&runner, "input", &[1.0, 2.0, 3.0, 4.0])).unwrap();
    let result = runner.pop().unwrap().unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result.require("output").unwrap().dtype(), ElementType::Float32);
    assert_eq!(values(&result, "output"), vec![2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn test_results_come_out_in_push_order() {
    let runner = Arc::new(
        PipelinedModelRunner::new(vec![
            map_stage("x", "a", |x| x + 1.0),
            map_stage("a", "b", |x| x * 2.0),
            map_stage("b", "y", |x| x - 3.0),
        ])
        .unwrap(),
    );

    let producer = {
        let runner = Arc::clone(&runner);
        thread::spawn(move || {
            for i in 0..50 {
                runner.push(request(&runner, "x", &[i as f32])).unwrap();
            }
            runner.close();
        })
    };

    let mut seen = Vec::new();
    while let Some(result) = runner.pop().unwrap() {
        seen.push(values(&result, "y")[0]);
    }
    producer.join().unwrap();

    let expected: Vec<f32> = (0..50).map(|i| (i as f32 + 1.0) * 2.0 - 3.0).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_failure_stays_in_its_slot() {
    let picky: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new(
        vec![TensorSpec::new("mid", ElementType::Float32)],
        vec![TensorSpec::new("out", ElementType::Float32)],
        |inputs, outputs| {
            let v: Vec<f32> = inputs.require("mid")?.to_vec()?;
            if v[0] == 3.0 {
                return Err(TensorError::execution("refusing request"));
            }
            outputs.write_slice("out", &v)
        },
    ));
    let runner =
        PipelinedModelRunner::new(vec![map_stage("in", "mid", |x| x + 1.0), picky]).unwrap();

    for i in 1..=3 {
        runner.push(request(&runner, "in", &[i as f32])).unwrap();
    }
    runner.close();

    assert_eq!(values(&runner.pop().unwrap().unwrap(), "out"), vec![2.0]);
    match runner.pop() {
        Err(PipelineError::Segment { segment, message }) => {
            assert_eq!(segment, 1);
            assert!(message.contains("refusing request"));
        }
        other => panic!("expected segment error, got {:?}", other.map(|r| r.map(|s| s.len()))),
    }
    assert_eq!(values(&runner.pop().unwrap().unwrap(), "out"), vec![4.0]);
    assert!(runner.pop().unwrap().is_none());

    let stats = runner.segment_stats();
    assert_eq!(stats[0].invocations, 3);
    assert_eq!(stats[0].failures, 0);
    assert_eq!(stats[1].invocations, 3);
    assert_eq!(stats[1].failures, 1);
}

#[test]
fn test_panicking_executor_becomes_error() {
    let boom: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new(
        vec![TensorSpec::new("in", ElementType::Float32)],
        vec![TensorSpec::new("out", ElementType::Float32)],
        |_, _| panic!("kernel fault"),
    ));
    let runner = PipelinedModelRunner::new(vec![boom]).unwrap();

    runner.push(request(&runner, "in", &[1.0])).unwrap();
    let err = runner.pop().unwrap_err();
    assert!(err.to_string().contains("kernel fault"));

    // The worker survives and keeps serving.
    runner.push(request(&runner, "in", &[1.0])).unwrap();
    assert!(runner.pop().is_err());
    assert_eq!(runner.live_workers(), 1);
}

#[test]
fn test_missing_output_is_reported() {
    let lazy: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new(
        vec![TensorSpec::new("in", ElementType::Float32)],
        vec![TensorSpec::new("out", ElementType::Float32)],
        |_, _| Ok(()),
    ));
    let runner = PipelinedModelRunner::new(vec![lazy]).unwrap();

    runner.push(request(&runner, "in", &[1.0])).unwrap();
    assert!(matches!(
        runner.pop(),
        Err(PipelineError::InvalidOutput { segment: 0, .. })
    ));
}

#[test]
fn test_full_queues_block_push_until_pop() {
    let runner = Arc::new(
        PipelinedModelRunner::builder(vec![map_stage("in", "out", |x| x)])
            .config(PipelineConfig {
                input_queue_capacity: Some(1),
                output_queue_capacity: Some(1),
                ..Default::default()
            })
            .build()
            .unwrap(),
    );

    // One result in the output queue, one held by the worker, one in the
    // input queue. The fourth push has nowhere to go.
    let (tx, rx) = mpsc::channel();
    let producer = {
        let runner = Arc::clone(&runner);
        thread::spawn(move || {
            for i in 0..4 {
                runner.push(request(&runner, "in", &[i as f32])).unwrap();
                tx.send(i).unwrap();
            }
        })
    };

    for i in 0..3 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    assert_eq!(values(&runner.pop().unwrap().unwrap(), "out"), vec![0.0]);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
    producer.join().unwrap();

    runner.close();
    let mut rest = Vec::new();
    while let Some(result) = runner.pop().unwrap() {
        rest.push(values(&result, "out")[0]);
    }
    assert_eq!(rest, vec![1.0, 2.0, 3.0]);
    assert!(runner.queue_high_water_marks().iter().all(|&depth| depth <= 1));
}

#[test]
fn test_close_drains_in_flight_requests() {
    let runner = PipelinedModelRunner::new(vec![
        map_stage("in", "mid", |x| x + 1.0),
        map_stage("mid", "out", |x| x + 1.0),
    ])
    .unwrap();
    runner.set_input_queue_capacity(8).unwrap();
    runner.set_output_queue_capacity(8).unwrap();

    for i in 0..5 {
        runner.push(request(&runner, "in", &[i as f32])).unwrap();
    }
    runner.close();

    let mut drained = 0;
    while runner.pop().unwrap().is_some() {
        drained += 1;
    }
    assert_eq!(drained, 5);

    assert_eq!(runner.shutdown(), 0);
    assert_eq!(runner.live_workers(), 0);
}

#[test]
fn test_push_after_close_is_rejected() {
    let runner = PipelinedModelRunner::new(vec![map_stage("in", "out", |x| x)]).unwrap();
    runner.close();

    let err = runner.push(request(&runner, "in", &[1.0])).unwrap_err();
    assert!(matches!(err, PipelineError::Closed));
    assert_eq!(err.to_string(), "pipeline was turned off before");
}

#[test]
fn test_capacity_change_after_first_push_is_rejected() {
    let runner = PipelinedModelRunner::new(vec![map_stage("in", "out", |x| x)]).unwrap();
    runner.push(request(&runner, "in", &[1.0])).unwrap();

    assert!(matches!(
        runner.set_input_queue_capacity(4),
        Err(PipelineError::Config(_))
    ));
    assert!(matches!(
        runner.set_output_queue_capacity(4),
        Err(PipelineError::Config(_))
    ));
}

#[test]
fn test_disconnected_chain_is_rejected() {
    let result = PipelinedModelRunner::new(vec![
        map_stage("in", "a", |x| x),
        map_stage("b", "out", |x| x),
    ]);
    match result {
        Err(PipelineError::Config(message)) => {
            assert!(message.contains("segment 1 can not get its input tensors"))
        }
        _ => panic!("expected config error"),
    }
}

#[test]
fn test_wrong_input_is_rejected() {
    let runner = PipelinedModelRunner::new(vec![map_stage("in", "out", |x| x)]).unwrap();
    let err = runner.push(request(&runner, "other", &[1.0])).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[test]
fn test_skip_connection_reaches_last_segment() {
    let combine: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new(
        vec![
            TensorSpec::new("x", ElementType::Float32),
            TensorSpec::new("h", ElementType::Float32),
        ],
        vec![TensorSpec::new("y", ElementType::Float32)],
        |inputs, outputs| {
            let x: Vec<f32> = inputs.require("x")?.to_vec()?;
            let h: Vec<f32> = inputs.require("h")?.to_vec()?;
            let sum: Vec<f32> = x.iter().zip(&h).map(|(a, b)| a + b).collect();
            outputs.write_slice("y", &sum)
        },
    ));
    let runner = PipelinedModelRunner::new(vec![
        map_stage("x", "h0", |v| v * 10.0),
        map_stage("h0", "h", |v| v + 1.0),
        combine,
    ])
    .unwrap();

    runner.push(request(&runner, "x", &[1.0, 2.0])).unwrap();
    let result = runner.pop().unwrap().unwrap();

    // Only the last segment's outputs are returned.
    assert_eq!(result.names().collect::<Vec<_>>(), vec!["y"]);
    assert_eq!(values(&result, "y"), vec![12.0, 23.0]);
}

#[test]
fn test_every_buffer_is_freed_exactly_once() {
    let pipeline_alloc = Arc::new(TrackingAllocator::new());
    let output_alloc = Arc::new(TrackingAllocator::wrap(TransferAllocator::new()));

    let flaky: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new(
        vec![
            TensorSpec::new("x", ElementType::Float32),
            TensorSpec::new("h", ElementType::Float32),
        ],
        vec![TensorSpec::new("y", ElementType::Float32)],
        |inputs, outputs| {
            let h: Vec<f32> = inputs.require("h")?.to_vec()?;
            outputs.write_slice("y", &h)?;
            if h[0] as i32 % 3 == 0 {
                return Err(TensorError::execution("every third request fails"));
            }
            Ok(())
        },
    ));

    let runner = PipelinedModelRunner::builder(vec![map_stage("x", "h", |v| v + 1.0), flaky])
        .input_allocator(pipeline_alloc.clone())
        .output_allocator(output_alloc.clone())
        .build()
        .unwrap();

    for i in 0..10 {
        runner.push(request(&runner, "x", &[i as f32])).unwrap();
    }
    runner.close();

    let (mut ok, mut failed) = (0, 0);
    loop {
        match runner.pop() {
            Ok(Some(_)) => ok += 1,
            Ok(None) => break,
            Err(_) => failed += 1,
        }
    }
    assert_eq!(ok + failed, 10);
    assert_eq!(failed, 3);
    runner.shutdown();

    let input_report = pipeline_alloc.report();
    assert!(pipeline_alloc.is_balanced(), "{:?}", input_report);
    // Ten pushed inputs and ten intermediates.
    assert_eq!(input_report.allocations, 20);
    assert_eq!(input_report.double_frees, 0);

    let output_report = output_alloc.report();
    assert!(output_alloc.is_balanced(), "{:?}", output_report);
    assert_eq!(output_report.allocations, 10);
}

#[test]
fn test_dropping_runner_frees_unconsumed_results() {
    let pipeline_alloc = Arc::new(TrackingAllocator::new());
    let output_alloc = Arc::new(TrackingAllocator::wrap(TransferAllocator::new()));

    {
        let runner = PipelinedModelRunner::builder(vec![map_stage("in", "out", |x| x)])
            .input_allocator(pipeline_alloc.clone())
            .output_allocator(output_alloc.clone())
            .config(PipelineConfig {
                input_queue_capacity: Some(4),
                output_queue_capacity: Some(4),
                ..Default::default()
            })
            .build()
            .unwrap();
        for i in 0..3 {
            runner.push(request(&runner, "in", &[i as f32])).unwrap();
        }
    }

    assert!(pipeline_alloc.is_balanced());
    assert!(output_alloc.is_balanced());
    assert_eq!(output_alloc.report().allocations, 3);
}

#[test]
fn test_output_allocation_failure_is_reported() {
    let output_alloc = TrackingAllocator::wrap(TransferAllocator::new()).with_limit(8);
    let runner = PipelinedModelRunner::builder(vec![map_stage("in", "out", |x| x)])
        .output_allocator(Arc::new(output_alloc))
        .build()
        .unwrap();

    runner.push(request(&runner, "in", &[1.0, 2.0, 3.0, 4.0])).unwrap();
    assert!(matches!(
        runner.pop(),
        Err(PipelineError::Allocation { segment: 0, .. })
    ));

    // Small requests still fit.
    runner.push(request(&runner, "in", &[1.0])).unwrap();
    assert_eq!(values(&runner.pop().unwrap().unwrap(), "out"), vec![1.0]);
}

#[test]
fn test_unaddressable_output_size_is_an_allocation_error() {
    let greedy: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new(
        vec![TensorSpec::new("in", ElementType::Float32)],
        vec![TensorSpec::new("out", ElementType::Float32)],
        |_, outputs| {
            outputs.allocate("out", ElementType::Float32, usize::MAX / 4 + 1)?;
            Ok(())
        },
    ));
    let runner = PipelinedModelRunner::new(vec![greedy]).unwrap();

    runner.push(request(&runner, "in", &[1.0])).unwrap();
    assert!(matches!(
        runner.pop(),
        Err(PipelineError::Allocation { segment: 0, .. })
    ));
    assert_eq!(runner.segment_stats()[0].failures, 1);
}

#[derive(Default)]
struct CountingLock {
    releases: AtomicUsize,
    reacquires: AtomicUsize,
}

impl HostLock for CountingLock {
    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn reacquire(&self) {
        self.reacquires.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_host_lock_is_released_while_pop_blocks() {
    let lock = Arc::new(CountingLock::default());
    let runner = Arc::new(
        PipelinedModelRunner::builder(vec![map_stage("in", "out", |x| x)])
            .host_lock(lock.clone())
            .build()
            .unwrap(),
    );

    let consumer = {
        let runner = Arc::clone(&runner);
        thread::spawn(move || runner.pop().unwrap().map(|r| values(&r, "out")))
    };

    // Blocked in pop with the lock released.
    wait_until(|| lock.releases.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(lock.reacquires.load(Ordering::SeqCst), 0);

    runner.push(request(&runner, "in", &[7.0])).unwrap();
    assert_eq!(consumer.join().unwrap(), Some(vec![7.0]));

    assert_eq!(lock.releases.load(Ordering::SeqCst), 2);
    assert_eq!(lock.reacquires.load(Ordering::SeqCst), 2);
}

/// Tries a capacity change from inside the first `release`, which `push`
/// calls after committing to the request and before enqueueing it.
#[derive(Default)]
struct ResizeOnReleaseLock {
    runner: OnceLock<Weak<PipelinedModelRunner>>,
    resize_rejected: Mutex<Option<bool>>,
}

impl HostLock for ResizeOnReleaseLock {
    fn release(&self) {
        let mut outcome = self.resize_rejected.lock().unwrap();
        if outcome.is_some() {
            return;
        }
        if let Some(runner) = self.runner.get().and_then(Weak::upgrade) {
            *outcome = Some(runner.set_input_queue_capacity(5).is_err());
        }
    }

    fn reacquire(&self) {}
}

#[test]
fn test_capacity_change_racing_first_push_is_rejected() {
    let lock = Arc::new(ResizeOnReleaseLock::default());
    let runner = Arc::new(
        PipelinedModelRunner::builder(vec![map_stage("in", "out", |x| x)])
            .host_lock(lock.clone())
            .build()
            .unwrap(),
    );
    lock.runner.set(Arc::downgrade(&runner)).unwrap();

    runner.push(request(&runner, "in", &[1.0])).unwrap();

    assert_eq!(*lock.resize_rejected.lock().unwrap(), Some(true));
    assert_eq!(runner.queue_capacities(), vec![1, 1]);
    assert_eq!(values(&runner.pop().unwrap().unwrap(), "out"), vec![1.0]);
}
